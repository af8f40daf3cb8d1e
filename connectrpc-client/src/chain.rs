//! The interceptor chain engine.
//!
//! The engine is generic over the value being threaded through the chain:
//! the same traversal code serves typed requests, raw requests, responses,
//! and stream results. Each hook consumes the current value exactly once
//! and produces the next one; a hook that needs to defer simply awaits
//! before returning.

use futures::future::BoxFuture;
use std::sync::Arc;

use connectrpc_client_core::ConnectError;

/// A non-failing hook: transforms the value, possibly asynchronously.
pub type Hook<V> = Box<dyn FnOnce(V) -> BoxFuture<'static, V> + Send>;

/// A failing hook: may short-circuit the chain with an error.
pub type FailableHook<V> = Box<dyn FnOnce(V) -> BoxFuture<'static, Result<V, ConnectError>> + Send>;

/// Direction a chain is traversed in.
///
/// Hooks are stored in registration order; outbound phases run
/// `FirstInFirstOut` and inbound phases `LastInFirstOut`, so the protocol
/// interceptor (registered last) is always closest to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    FirstInFirstOut,
    LastInFirstOut,
}

fn ordered<H>(mut hooks: Vec<H>, order: TraversalOrder) -> Vec<H> {
    if order == TraversalOrder::LastInFirstOut {
        hooks.reverse();
    }
    hooks
}

/// Run every hook over the value in the given order.
pub async fn execute_interceptors<V: Send>(
    hooks: Vec<Hook<V>>,
    order: TraversalOrder,
    initial: V,
) -> V {
    let mut value = initial;
    for hook in ordered(hooks, order) {
        value = hook(value).await;
    }
    value
}

/// Run hooks in order, stopping at the first failure.
///
/// Hooks after the failing one never observe the value.
pub async fn execute_interceptors_and_stop_on_failure<V: Send>(
    hooks: Vec<FailableHook<V>>,
    order: TraversalOrder,
    initial: V,
) -> Result<V, ConnectError> {
    let mut value = initial;
    for hook in ordered(hooks, order) {
        value = hook(value).await?;
    }
    Ok(value)
}

/// Run two hook phases joined by a transform.
///
/// The first phase runs to completion in the given order, the transform
/// converts the value (e.g., serializes a typed message), and the second
/// phase runs in the same order over the converted value.
pub async fn execute_linked_interceptors<V1, V2, T>(
    first: Vec<Hook<V1>>,
    order: TraversalOrder,
    initial: V1,
    transform: T,
    second: Vec<Hook<V2>>,
) -> V2
where
    V1: Send,
    V2: Send,
    T: FnOnce(V1) -> BoxFuture<'static, V2> + Send,
{
    let mid = execute_interceptors(first, order, initial).await;
    let converted = transform(mid).await;
    execute_interceptors(second, order, converted).await
}

/// Linked traversal where hooks and the transform may all fail.
///
/// A failure anywhere skips everything downstream, including the second
/// phase.
pub async fn execute_linked_interceptors_and_stop_on_failure<V1, V2, T>(
    first: Vec<FailableHook<V1>>,
    order: TraversalOrder,
    initial: V1,
    transform: T,
    second: Vec<FailableHook<V2>>,
) -> Result<V2, ConnectError>
where
    V1: Send,
    V2: Send,
    T: FnOnce(V1) -> BoxFuture<'static, Result<V2, ConnectError>> + Send,
{
    let mid = execute_interceptors_and_stop_on_failure(first, order, initial).await?;
    let converted = transform(mid).await?;
    execute_interceptors_and_stop_on_failure(second, order, converted).await
}

/// An instantiated chain of interceptors for a single call or stream.
pub struct InterceptorChain<T: ?Sized> {
    pub interceptors: Vec<Arc<T>>,
}

impl<T: ?Sized> InterceptorChain<T> {
    pub fn new(interceptors: Vec<Arc<T>>) -> Self {
        Self { interceptors }
    }

    /// Build one hook per interceptor, in registration order.
    pub fn hooks<V, F>(&self, make: F) -> Vec<Hook<V>>
    where
        F: Fn(Arc<T>) -> Hook<V>,
    {
        self.interceptors.iter().cloned().map(make).collect()
    }

    /// Build one failable hook per interceptor, in registration order.
    pub fn failable_hooks<V, F>(&self, make: F) -> Vec<FailableHook<V>>
    where
        F: Fn(Arc<T>) -> FailableHook<V>,
    {
        self.interceptors.iter().cloned().map(make).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectrpc_client_core::Code;
    use std::sync::Mutex;

    fn recording_hook(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> Hook<Vec<&'static str>> {
        Box::new(move |mut value| {
            Box::pin(async move {
                log.lock().unwrap().push(name);
                value.push(name);
                value
            })
        })
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            recording_hook(log.clone(), "a"),
            recording_hook(log.clone(), "b"),
            recording_hook(log.clone(), "c"),
        ];
        let value =
            execute_interceptors(hooks, TraversalOrder::FirstInFirstOut, Vec::new()).await;
        assert_eq!(value, vec!["a", "b", "c"]);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_lifo_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks = vec![
            recording_hook(log.clone(), "a"),
            recording_hook(log.clone(), "b"),
            recording_hook(log.clone(), "c"),
        ];
        let value = execute_interceptors(hooks, TraversalOrder::LastInFirstOut, Vec::new()).await;
        assert_eq!(value, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_delayed_hook_preserves_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow_log = log.clone();
        let slow: Hook<Vec<&'static str>> = Box::new(move |mut value| {
            Box::pin(async move {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                slow_log.lock().unwrap().push("slow");
                value.push("slow");
                value
            })
        });
        let hooks = vec![slow, recording_hook(log.clone(), "fast")];
        let value =
            execute_interceptors(hooks, TraversalOrder::FirstInFirstOut, Vec::new()).await;
        assert_eq!(value, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_stop_on_failure_skips_later_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));

        let ok_log = log.clone();
        let ok: FailableHook<u32> = Box::new(move |value| {
            Box::pin(async move {
                ok_log.lock().unwrap().push("ok");
                Ok(value + 1)
            })
        });
        let fail: FailableHook<u32> = Box::new(move |_| {
            Box::pin(async move { Err(ConnectError::new(Code::Aborted, "stop")) })
        });
        let never_log = log.clone();
        let never: FailableHook<u32> = Box::new(move |value| {
            Box::pin(async move {
                never_log.lock().unwrap().push("never");
                Ok(value)
            })
        });

        let result = execute_interceptors_and_stop_on_failure(
            vec![ok, fail, never],
            TraversalOrder::FirstInFirstOut,
            0,
        )
        .await;
        assert_eq!(result.unwrap_err().code, Code::Aborted);
        assert_eq!(*log.lock().unwrap(), vec!["ok"]);
    }

    #[tokio::test]
    async fn test_linked_phases_share_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = vec![
            recording_hook(log.clone(), "t1"),
            recording_hook(log.clone(), "t2"),
        ];
        let second = vec![
            recording_hook(log.clone(), "r1"),
            recording_hook(log.clone(), "r2"),
        ];
        let transform_log = log.clone();
        let value = execute_linked_interceptors(
            first,
            TraversalOrder::LastInFirstOut,
            Vec::new(),
            move |mut value: Vec<&'static str>| {
                Box::pin(async move {
                    transform_log.lock().unwrap().push("xform");
                    value.push("xform");
                    value
                }) as BoxFuture<'static, Vec<&'static str>>
            },
            second,
        )
        .await;
        assert_eq!(value, vec!["t2", "t1", "xform", "r2", "r1"]);
    }

    #[tokio::test]
    async fn test_linked_failure_skips_transform_and_second_phase() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fail: FailableHook<u32> = Box::new(|_| {
            Box::pin(async move { Err(ConnectError::new(Code::Internal, "boom")) })
        });
        let transform_log = log.clone();
        let second_log = log.clone();
        let second: FailableHook<u32> = Box::new(move |value| {
            let second_log = second_log.clone();
            Box::pin(async move {
                second_log.lock().unwrap().push("second");
                Ok(value)
            })
        });

        let result = execute_linked_interceptors_and_stop_on_failure(
            vec![fail],
            TraversalOrder::FirstInFirstOut,
            0u32,
            move |value| {
                let transform_log = transform_log.clone();
                Box::pin(async move {
                    transform_log.lock().unwrap().push("xform");
                    Ok(value)
                }) as BoxFuture<'static, Result<u32, ConnectError>>
            },
            vec![second],
        )
        .await;
        assert_eq!(result.unwrap_err().code, Code::Internal);
        assert!(log.lock().unwrap().is_empty());
    }
}
