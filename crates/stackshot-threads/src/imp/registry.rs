use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use stackshot_capture::StackBounds;

/// A thread that opted in to sampling. Everything here is recorded by the
/// thread itself at registration, so reading it never touches the thread.
#[derive(Clone)]
pub(crate) struct ThreadEntry {
    pub(crate) tid: libc::pid_t,
    pub(crate) pthread_id: libc::pthread_t,
    pub(crate) name: String,
    pub(crate) stack: StackBounds,
    pub(crate) idle: Arc<AtomicBool>,
}

static THREAD_REGISTRY: Mutex<Vec<ThreadEntry>> = parking_lot::const_mutex(Vec::new());

thread_local! {
    static CURRENT_IDLE: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

pub(crate) fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn pthread_eq(a: libc::pthread_t, b: libc::pthread_t) -> bool {
    unsafe { libc::pthread_equal(a, b) != 0 }
}

/// Stack range of the calling thread from its pthread attributes.
pub(crate) fn current_stack_bounds() -> StackBounds {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return StackBounds::INVALID;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return StackBounds::INVALID;
        }
        let low = addr as usize;
        StackBounds::new(low, low.saturating_add(size))
    }
}

pub(crate) fn register_thread(name: &str) {
    let pthread_id = unsafe { libc::pthread_self() };
    let idle = Arc::new(AtomicBool::new(false));
    let entry = ThreadEntry {
        tid: gettid(),
        pthread_id,
        name: name.to_string(),
        stack: current_stack_bounds(),
        idle: Arc::clone(&idle),
    };

    let mut reg = THREAD_REGISTRY.lock();
    reg.retain(|e| !pthread_eq(e.pthread_id, pthread_id));
    reg.push(entry);
    drop(reg);

    CURRENT_IDLE.with(|slot| *slot.borrow_mut() = Some(idle));
}

pub(crate) fn deregister_thread() {
    let self_id = unsafe { libc::pthread_self() };
    THREAD_REGISTRY
        .lock()
        .retain(|e| !pthread_eq(e.pthread_id, self_id));
    let _ = CURRENT_IDLE.try_with(|slot| slot.borrow_mut().take());
}

pub(crate) fn set_current_thread_idle(idle: bool) {
    CURRENT_IDLE.with(|slot| {
        if let Some(flag) = slot.borrow().as_ref() {
            flag.store(idle, Ordering::Relaxed);
        }
    });
}

pub(crate) fn snapshot() -> Vec<ThreadEntry> {
    THREAD_REGISTRY.lock().clone()
}

pub(crate) fn registered_name(tid: libc::pid_t) -> Option<String> {
    THREAD_REGISTRY
        .lock()
        .iter()
        .find(|e| e.tid == tid)
        .map(|e| e.name.clone())
}
