use lazy_static::lazy_static;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

lazy_static! {
    static ref RUNTIME: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);
}

// Handle for a stoppable background task. Awaiting the join handle
// after cancelling (or otherwise signalling the task to stop) confirms
// it actually exited.
pub struct TaskHandle {
    pub handle: JoinHandle<()>,
    pub cancel: CancellationToken,
}

pub fn async_init() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("gatekeeper")
        .build()
        .expect("Failed to build runtime");

    let mut rt_lock = RUNTIME.lock().expect("Failed to lock runtime");
    *rt_lock = Some(Arc::new(rt));
}

pub fn async_exec<R, F>(async_fn: F) -> R
where
    R: 'static,
    F: Future<Output = R> + 'static,
{
    let rt = {
        let rt_lock = RUNTIME.lock().expect("Failed to lock runtime");
        rt_lock.as_ref().expect("Runtime not initialized").clone()
    };

    rt.block_on(async_fn)
}

pub fn async_spawn<F>(async_fn: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + 'static + Send,
{
    // Prefer the ambient runtime when already inside one, e.g. in tests.
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        return handle.spawn(async_fn);
    }

    let rt = {
        let rt_lock = RUNTIME.lock().expect("Failed to lock runtime");
        rt_lock.as_ref().expect("Runtime not initialized").clone()
    };

    rt.spawn(async_fn)
}
