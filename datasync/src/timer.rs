//! Restartable one-shot timer.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Fires `callback` once `duration` has elapsed since the last
/// [`restart`](Self::restart). Dropping the handle cancels it.
pub struct TimeoutHandle {
    duration: Duration,
    callback: Callback,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutHandle {
    pub fn new(duration: Duration, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            duration,
            callback: Arc::new(callback),
            task: Mutex::new(None),
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// (Re)arm the timer. Outside a tokio runtime this is a no-op.
    pub fn restart(&self) {
        let Ok(handle) = Handle::try_current() else {
            log::warn!("Timer restarted outside a runtime; ignoring");
            return;
        };
        let callback = self.callback.clone();
        let duration = self.duration;
        let task = handle.spawn(async move {
            tokio::time::sleep(duration).await;
            callback();
        });
        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TimeoutHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let inner = fired.clone();
        (fired, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_fires_once() {
        let (fired, callback) = counter();
        let timer = TimeoutHandle::new(Duration::from_millis(40), callback);
        timer.restart();
        assert!(timer.is_armed());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
    }

    #[tokio::test]
    async fn test_restart_postpones() {
        let (fired, callback) = counter();
        let timer = TimeoutHandle::new(Duration::from_millis(200), callback);
        timer.restart();
        tokio::time::sleep(Duration::from_millis(120)).await;
        timer.restart();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_and_drop_cancel() {
        let (fired, callback) = counter();
        let timer = TimeoutHandle::new(Duration::from_millis(40), callback);
        timer.restart();
        timer.stop();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        timer.restart();
        drop(timer);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
