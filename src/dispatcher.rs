//! Page fault dispatch.
//!
//! The dispatcher owns the process-wide SIGSEGV handler. Each fault is offered
//! to the active [`LoaderState`]; faults it does not resolve go to whatever
//! disposition was installed before the dispatcher, so a genuine fault ends
//! the same way it would have without the loader.

use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Mutex, OnceLock};

use libc::{c_int, c_void, siginfo_t};
use tracing::{debug, info};

use crate::addr::VirtAddr;
use crate::error::{GenuineFault, LoadError, Result};
use crate::loader::{FaultOutcome, LoaderState};
use crate::mapper::AnonymousMapper;

static DISPATCHER: OnceLock<PageFaultDispatcher> = OnceLock::new();
static INSTALL: Mutex<()> = Mutex::new(());
static ACTIVE: AtomicPtr<LoaderState> = AtomicPtr::new(ptr::null_mut());

type Handler = extern "C" fn(c_int);
type Action = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);

/// A signal disposition, as it was before the dispatcher replaced it.
#[derive(Debug, Clone, Copy)]
pub enum Disposition {
    Default,
    Ignore,
    Handler(Handler),
    Action(Action),
}

impl Disposition {
    fn from_sigaction(action: &libc::sigaction) -> Self {
        match action.sa_sigaction {
            libc::SIG_DFL => Disposition::Default,
            libc::SIG_IGN => Disposition::Ignore,
            f if action.sa_flags & libc::SA_SIGINFO != 0 => {
                Disposition::Action(unsafe { mem::transmute::<libc::sighandler_t, Action>(f) })
            }
            f => Disposition::Handler(unsafe { mem::transmute::<libc::sighandler_t, Handler>(f) }),
        }
    }
}

/// The installed SIGSEGV handler and what it replaced.
#[derive(Debug)]
pub struct PageFaultDispatcher {
    previous: Disposition,
}

impl PageFaultDispatcher {
    pub fn previous(&self) -> Disposition {
        self.previous
    }

    /// Makes `state` the target of every fault until the returned guard is dropped.
    ///
    /// Only one image can be active per process; a second activation fails with `Busy`.
    pub fn activate<'a>(&self, state: &'a LoaderState) -> Result<ActiveImage<'a>> {
        let ptr = state as *const LoaderState as *mut LoaderState;
        ACTIVE
            .compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LoadError::Busy)?;
        debug!("activated image with {} segments", state.segments().len());
        Ok(ActiveImage { state })
    }
}

/// Keeps a [`LoaderState`] published to the fault handler.
pub struct ActiveImage<'a> {
    state: &'a LoaderState,
}

impl ActiveImage<'_> {
    pub fn state(&self) -> &LoaderState {
        self.state
    }
}

impl Drop for ActiveImage<'_> {
    fn drop(&mut self) {
        ACTIVE.store(ptr::null_mut(), Ordering::Release);
        debug!("deactivated image");
    }
}

/// Installs the SIGSEGV dispatcher for this process.
///
/// Calling it again is a no-op that returns the dispatcher installed first;
/// the previous disposition is captured only once.
pub fn initialize_loader() -> Result<&'static PageFaultDispatcher> {
    let _guard = INSTALL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(dispatcher) = DISPATCHER.get() {
        debug!("fault dispatcher already installed");
        return Ok(dispatcher);
    }

    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = segv_handler as Action as libc::sighandler_t;
    // Stack overflow faults can only be handled on the alternate signal stack.
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
    let mut old: libc::sigaction = unsafe { mem::zeroed() };
    let rc = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(libc::SIGSEGV, &action, &mut old)
    };
    if rc != 0 {
        return Err(LoadError::Install(io::Error::last_os_error()));
    }

    let previous = Disposition::from_sigaction(&old);
    info!("installed fault dispatcher (previous: {:?})", previous);
    Ok(DISPATCHER.get_or_init(|| PageFaultDispatcher { previous }))
}

/// The dispatcher, if [`initialize_loader`] has run.
pub fn installed() -> Option<&'static PageFaultDispatcher> {
    DISPATCHER.get()
}

extern "C" fn segv_handler(signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let addr = VirtAddr::new(unsafe { (*info).si_addr() } as u64);
    let outcome = match unsafe { ACTIVE.load(Ordering::Acquire).as_ref() } {
        Some(state) => state.handle_fault(addr, &mut AnonymousMapper),
        None => FaultOutcome::Delegate(GenuineFault::Unowned),
    };
    if let FaultOutcome::Delegate(_) = outcome {
        delegate(signum, info, context);
    }
}

/// Hands a fault to the disposition that was active before the dispatcher.
///
/// For the default (and ignored) disposition, SIG_DFL is restored and the
/// faulting access is left to re-execute, terminating the process as usual.
fn delegate(signum: c_int, info: *mut siginfo_t, context: *mut c_void) {
    match DISPATCHER.get().map(PageFaultDispatcher::previous) {
        Some(Disposition::Action(action)) => action(signum, info, context),
        Some(Disposition::Handler(handler)) => handler(signum),
        Some(Disposition::Default | Disposition::Ignore) | None => unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, ptr::null_mut());
        },
    }
}
