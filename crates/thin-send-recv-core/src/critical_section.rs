//! Scoped acquisition of a consistent metadata-snap view.
//!
//! The acquisition sequence collapses into one RAII guard:
//! [`CriticalSection::enter`] performs steps 1–3 (lock, arm signals, reserve);
//! its [`Drop`] impl performs step 5 (release snap, restore signal
//! dispositions, release lock) on every exit path, including the early return
//! from a signal delivered mid-operation. Step 4 (invoking the dump tool into
//! a private unlinked temp file) is the caller's responsibility — it happens
//! while the guard is held, via [`create_unlinked_tmpfile`].
//!
//! The guard is only ever held across two kinds of operation: the lock/snap
//! ioctls (fast, never block for long) and a single external dump-tool
//! invocation the caller waits on. That wait is the one real checkpoint in
//! this design: callers poll [`CriticalSection::check_signal`] in the
//! dump-tool wait loop (see `thin-send-recv-cli`'s `dump` module), which
//! turns the indefinite wait into a bounded one. `protocol` and `copier`
//! never run while a `CriticalSection` is held — by the time either drives
//! I/O, the dump has already been captured and the guard has already
//! dropped — so neither module polls this checkpoint.
//!
//! [`ASYNC_SIGNALS`] and [`FAULT_SIGNALS`] are handled differently, because
//! only one of them can be safely resumed from:
//!
//! - [`ASYNC_SIGNALS`] (`SIGTERM`, `SIGINT`, ...) are raised by something
//!   outside the faulting instruction stream, so a handler that stores a
//!   flag and returns is sound: execution resumes exactly where it left off,
//!   and [`CriticalSection::check_signal`] picks the flag up at the next
//!   checkpoint, releases the reservation, and reports
//!   [`CriticalSectionError::Interrupted`].
//! - [`FAULT_SIGNALS`] (`SIGSEGV`, `SIGBUS`, `SIGFPE`, `SIGABRT`) are raised
//!   by the faulting instruction itself; returning from their handler just
//!   re-executes that instruction and faults again, looping forever with the
//!   reservation still held. Their handler instead restores the signal to
//!   its default disposition and re-raises it, so the kernel terminates the
//!   process (core dump included) instead of looping. Running the
//!   async-signal-safe equivalent of the pool-control release command from
//!   inside that handler is not attempted: `PoolControl` is a generic trait
//!   object, and calling into it would require allocation and locking this
//!   crate cannot guarantee are async-signal-safe. A process killed by a
//!   genuine fault therefore leaves the metadata-snap reservation held; clearing
//!   it is an out-of-process operator action, the same as it would be for
//!   any process killed by `SIGKILL`. This is a documented limitation, not
//!   an oversight.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Default process-wide lock path, serializing concurrent invocations of this
/// tool over the pool-wide metadata-snap reservation.
pub const DEFAULT_LOCK_PATH: &str = "/var/run/thin-send-recv.lock";

/// Signals raised asynchronously, from outside the instruction stream.
/// Resuming after their handler returns is sound, so they are handled by
/// flagging an atomic and checkpoint-polling it.
pub const ASYNC_SIGNALS: &[libc::c_int] = &[
    libc::SIGALRM,
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGPIPE,
    libc::SIGPWR,
    libc::SIGQUIT,
    libc::SIGTERM,
    libc::SIGUSR1,
    libc::SIGUSR2,
    libc::SIGXCPU,
    libc::SIGXFSZ,
];

/// Synchronous faults raised by the faulting instruction itself. Returning
/// from their handler re-executes that instruction, so they cannot be
/// handled by checkpoint-polling — their handler terminates the process
/// instead of returning.
pub const FAULT_SIGNALS: &[libc::c_int] = &[libc::SIGABRT, libc::SIGBUS, libc::SIGFPE, libc::SIGSEGV];

/// Exit code a signal delivered during the critical section produces.
pub const SIGNAL_EXIT_CODE: i32 = 10;

static SIGNAL_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn record_signal(_signum: libc::c_int) {
    // The only operation this handler may safely perform: a plain atomic
    // store compiles to a single machine instruction and touches no libc
    // state, so it is async-signal-safe on every platform libc targets.
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
}

extern "C" fn record_fault_and_terminate(signum: libc::c_int) {
    SIGNAL_RECEIVED.store(true, Ordering::SeqCst);
    // SAFETY: signum is one of the fixed FAULT_SIGNALS constants; SIG_DFL is
    // always a valid disposition and raise() of a signal already pending
    // against this thread is async-signal-safe. Restoring the default
    // disposition before re-raising means the kernel terminates the process
    // here instead of returning control to the faulting instruction.
    unsafe {
        libc::signal(signum, libc::SIG_DFL);
        libc::raise(signum);
    }
}

#[derive(Debug, Error)]
pub enum CriticalSectionError {
    #[error("cannot lock {path}: {source}")]
    Lock { path: PathBuf, #[source] source: io::Error },
    #[error("failed to install signal handler for signal {signum}: {source}")]
    SignalInstall { signum: libc::c_int, #[source] source: io::Error },
    #[error("failed to reserve metadata snap: {0}")]
    Reserve(#[source] PoolControlError),
    #[error("failed to release metadata snap: {0}")]
    Release(#[source] PoolControlError),
    #[error("operation interrupted by fatal signal")]
    Interrupted,
}

#[derive(Debug, Error)]
#[error("pool-control command failed: {0}")]
pub struct PoolControlError(pub String);

/// Seam for the external pool-control invocation: a command to reserve and
/// release the metadata snap and, optionally, to toggle activation of a
/// snapshot. Kept as a trait so tests can supply a fake instead of shelling
/// out to a real pool-control binary.
pub trait PoolControl {
    fn reserve_metadata_snap(&self, pool_name: &str) -> Result<(), PoolControlError>;
    fn release_metadata_snap(&self, pool_name: &str) -> Result<(), PoolControlError>;
    fn set_active(&self, thin_id: u32, pool_name: &str, active: bool) -> Result<(), PoolControlError>;
}

/// An advisory-locked, mode-0644 lock file held for the lifetime of the
/// critical section.
struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: &Path) -> Result<Self, CriticalSectionError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o644)
            .open(path)
            .map_err(|source| CriticalSectionError::Lock { path: path.to_path_buf(), source })?;
        // SAFETY: `file`'s descriptor is valid and owned for the duration of
        // this call.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if ret != 0 {
            return Err(CriticalSectionError::Lock {
                path: path.to_path_buf(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(Self { file, path: path.to_path_buf() })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // SAFETY: fd is valid for the lifetime of `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

use std::os::unix::fs::OpenOptionsExt;

/// RAII guard covering lock acquisition, signal arming, and metadata-snap
/// reservation. Dropping it releases all three in reverse order.
pub struct CriticalSection<'a, P: PoolControl> {
    pool_control: &'a P,
    pool_name: String,
    _lock: LockFile,
    released: bool,
}

impl<'a, P: PoolControl> CriticalSection<'a, P> {
    /// Performs steps 1–3 of the acquisition sequence: lock, arm signal
    /// handlers, reserve the metadata snap. Any failure unwinds the steps
    /// already completed before returning the error.
    pub fn enter(pool_control: &'a P, pool_name: &str, lock_path: &Path) -> Result<Self, CriticalSectionError> {
        let lock = LockFile::acquire(lock_path)?;
        arm_signal_handlers()?;

        if let Err(e) = pool_control.reserve_metadata_snap(pool_name) {
            restore_signal_handlers();
            drop(lock);
            return Err(CriticalSectionError::Reserve(e));
        }

        Ok(Self { pool_control, pool_name: pool_name.to_string(), _lock: lock, released: false })
    }

    /// Polled by the caller at the one long blocking operation performed
    /// while the guard is held (waiting on the dump-tool subprocess).
    /// Returns `Err(Interrupted)` — after having already released the
    /// reservation — if an [`ASYNC_SIGNALS`] member arrived since the last
    /// checkpoint. The caller should propagate the error and the process
    /// should exit with [`SIGNAL_EXIT_CODE`].
    pub fn check_signal(&mut self) -> Result<(), CriticalSectionError> {
        if SIGNAL_RECEIVED.swap(false, Ordering::SeqCst) {
            self.release_once()?;
            return Err(CriticalSectionError::Interrupted);
        }
        Ok(())
    }

    fn release_once(&mut self) -> Result<(), CriticalSectionError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.pool_control
            .release_metadata_snap(&self.pool_name)
            .map_err(CriticalSectionError::Release)
    }
}

impl<'a, P: PoolControl> Drop for CriticalSection<'a, P> {
    fn drop(&mut self) {
        let _ = self.release_once();
        restore_signal_handlers();
        // `_lock` drops after this impl returns, releasing the lock file
        // last, matching the documented release order.
    }
}

fn arm_signal_handlers() -> Result<(), CriticalSectionError> {
    install_handler(ASYNC_SIGNALS, record_signal as usize)?;
    install_handler(FAULT_SIGNALS, record_fault_and_terminate as usize)?;
    Ok(())
}

fn install_handler(signals: &[libc::c_int], handler: usize) -> Result<(), CriticalSectionError> {
    for &signum in signals {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handler;
        // SA_RESTART is deliberately not set: a blocking wait should return
        // promptly so the checkpoint it's polled at is reached quickly.
        action.sa_flags = 0;
        // SAFETY: `action` is fully initialized; sigemptyset only touches
        // the mask field we own.
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
        }
        // SAFETY: signum is one of the fixed, valid ASYNC_SIGNALS/FAULT_SIGNALS constants.
        let ret = unsafe { libc::sigaction(signum, &action, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(CriticalSectionError::SignalInstall { signum, source: io::Error::last_os_error() });
        }
    }
    Ok(())
}

fn restore_signal_handlers() {
    for &signum in ASYNC_SIGNALS.iter().chain(FAULT_SIGNALS.iter()) {
        // SAFETY: SIG_DFL is always a valid disposition.
        unsafe {
            libc::signal(signum, libc::SIG_DFL);
        }
    }
}

/// Opens a private temporary file under `dir`, unlinks it immediately, and
/// marks the descriptor close-on-exec.
pub fn create_unlinked_tmpfile(dir: &Path) -> io::Result<File> {
    use std::ffi::CString;

    let template = dir.join("thin-send-recv-XXXXXX");
    let mut template_bytes = template.into_os_string().into_vec_with_nul();
    let ret = unsafe { libc::mkstemp(template_bytes.as_mut_ptr() as *mut libc::c_char) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let path_cstr = CString::new(
        template_bytes[..template_bytes.len() - 1]
            .iter()
            .map(|&b| b as u8)
            .collect::<Vec<u8>>(),
    )
    .expect("mkstemp template has no interior NUL");

    // SAFETY: `ret` is the valid fd just returned by mkstemp.
    unsafe {
        let flags = libc::fcntl(ret, libc::F_GETFD);
        libc::fcntl(ret, libc::F_SETFD, flags | libc::FD_CLOEXEC);
    }
    // SAFETY: path_cstr names the file mkstemp just created; unlinking it
    // immediately is the documented "private, anonymous" temp-file pattern.
    unsafe {
        libc::unlink(path_cstr.as_ptr());
    }

    // SAFETY: `ret` is an open, valid, owned fd; wrapping it in a `File`
    // transfers ownership so it is closed exactly once, on drop.
    Ok(unsafe { std::os::unix::io::FromRawFd::from_raw_fd(ret) })
}

trait IntoVecWithNul {
    fn into_vec_with_nul(self) -> Vec<u8>;
}

impl IntoVecWithNul for std::ffi::OsString {
    fn into_vec_with_nul(self) -> Vec<u8> {
        use std::os::unix::ffi::OsStringExt;
        let mut bytes = self.into_vec();
        bytes.push(0);
        bytes
    }
}
