// crates/core/src/intercept.rs
//! Call interception for request/response endpoints.
//!
//! [`Intercepted`] wraps any [`Endpoint`] (async) or [`BlockingEndpoint`]
//! (sync) and implements the same trait, so callers cannot tell the wrapper
//! from the original. Around every call it notifies the registered
//! [`CallObserver`]s:
//!
//! 1. `before(request)`
//! 2. the wrapped call
//! 3. `after(request, response)` or `on_error(request, error)`
//!
//! The result is returned unchanged. Observers only get shared references and
//! a panicking observer is caught and logged, so observers cannot change what
//! the caller sees. Wrappers nest (each layer wraps the previous one) and
//! [`Intercepted::into_inner`] gives the original endpoint back.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

/// Request, response and error types of an endpoint.
pub trait CallShape {
    type Request: Send + Sync + 'static;
    type Response: Send + Sync + 'static;
    type Error: Send + Sync + 'static;
}

/// An endpoint whose calls suspend.
#[async_trait]
pub trait Endpoint: CallShape + Send + Sync {
    async fn call(&self, request: &Self::Request) -> Result<Self::Response, Self::Error>;
}

/// An endpoint whose calls return immediately.
pub trait BlockingEndpoint: CallShape {
    fn call(&self, request: &Self::Request) -> Result<Self::Response, Self::Error>;
}

impl<E: CallShape + ?Sized> CallShape for Arc<E> {
    type Request = E::Request;
    type Response = E::Response;
    type Error = E::Error;
}

#[async_trait]
impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    async fn call(&self, request: &Self::Request) -> Result<Self::Response, Self::Error> {
        (**self).call(request).await
    }
}

impl<E: BlockingEndpoint + ?Sized> BlockingEndpoint for Arc<E> {
    fn call(&self, request: &Self::Request) -> Result<Self::Response, Self::Error> {
        (**self).call(request)
    }
}

/// Receives notifications around intercepted calls. All methods default to
/// doing nothing.
pub trait CallObserver<Req, Resp, Err>: Send + Sync {
    fn before(&self, _request: &Req) {}
    fn after(&self, _request: &Req, _response: &Resp) {}
    fn on_error(&self, _request: &Req, _error: &Err) {}
}

/// Observer type matching endpoint `E`.
pub type ObserverFor<E> = dyn CallObserver<
    <E as CallShape>::Request,
    <E as CallShape>::Response,
    <E as CallShape>::Error,
>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverList<Req, Resp, Err> = Vec<(ObserverId, Arc<dyn CallObserver<Req, Resp, Err>>)>;

/// Shared, cloneable list of observers. Clones see the same registrations.
pub struct ObserverSet<Req, Resp, Err> {
    observers: Arc<RwLock<ObserverList<Req, Resp, Err>>>,
    next_id: Arc<AtomicU64>,
}

impl<Req, Resp, Err> Clone for ObserverSet<Req, Resp, Err> {
    fn clone(&self) -> Self {
        Self {
            observers: self.observers.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<Req, Resp, Err> Default for ObserverSet<Req, Resp, Err> {
    fn default() -> Self {
        Self {
            observers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl<Req, Resp, Err> ObserverSet<Req, Resp, Err> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn CallObserver<Req, Resp, Err>>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.observers.write() {
            Ok(mut list) => list.push((id, observer)),
            Err(e) => tracing::error!("Observer list RwLock poisoned: {e}"),
        }
        id
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        match self.observers.write() {
            Ok(mut list) => {
                let before = list.len();
                list.retain(|(existing, _)| *existing != id);
                list.len() != before
            }
            Err(e) => {
                tracing::error!("Observer list RwLock poisoned: {e}");
                false
            }
        }
    }

    pub fn clear(&self) {
        match self.observers.write() {
            Ok(mut list) => list.clear(),
            Err(e) => tracing::error!("Observer list RwLock poisoned: {e}"),
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current observers so none are invoked under the lock.
    fn snapshot(&self) -> Vec<Arc<dyn CallObserver<Req, Resp, Err>>> {
        match self.observers.read() {
            Ok(list) => list.iter().map(|(_, o)| o.clone()).collect(),
            Err(e) => {
                tracing::error!("Observer list RwLock poisoned: {e}");
                Vec::new()
            }
        }
    }

    fn emit(&self, event: &'static str, f: impl Fn(&dyn CallObserver<Req, Resp, Err>)) {
        for observer in self.snapshot() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))) {
                tracing::warn!(
                    event,
                    panic = %panic_message(payload.as_ref()),
                    "Call observer panicked; continuing"
                );
            }
        }
    }

    pub fn notify_before(&self, request: &Req) {
        self.emit("before", |o| o.before(request));
    }

    pub fn notify_after(&self, request: &Req, response: &Resp) {
        self.emit("after", |o| o.after(request, response));
    }

    pub fn notify_error(&self, request: &Req, error: &Err) {
        self.emit("on_error", |o| o.on_error(request, error));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// An endpoint wrapped with call observers.
pub struct Intercepted<E: CallShape> {
    inner: E,
    observers: ObserverSet<E::Request, E::Response, E::Error>,
}

impl<E: CallShape> Intercepted<E> {
    pub fn new(inner: E) -> Self {
        Self::with_observers(inner, ObserverSet::new())
    }

    /// Wrap `inner` using an existing observer set, shared with its other holders.
    pub fn with_observers(inner: E, observers: ObserverSet<E::Request, E::Response, E::Error>) -> Self {
        Self { inner, observers }
    }

    pub fn observers(&self) -> &ObserverSet<E::Request, E::Response, E::Error> {
        &self.observers
    }

    pub fn register(&self, observer: Arc<ObserverFor<E>>) -> ObserverId {
        self.observers.register(observer)
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        self.observers.unregister(id)
    }

    /// Remove the interception and return the wrapped endpoint.
    pub fn into_inner(self) -> E {
        self.inner
    }
}

impl<E: CallShape> CallShape for Intercepted<E> {
    type Request = E::Request;
    type Response = E::Response;
    type Error = E::Error;
}

#[async_trait]
impl<E: Endpoint> Endpoint for Intercepted<E> {
    async fn call(&self, request: &Self::Request) -> Result<Self::Response, Self::Error> {
        self.observers.notify_before(request);
        match self.inner.call(request).await {
            Ok(response) => {
                self.observers.notify_after(request, &response);
                Ok(response)
            }
            Err(error) => {
                self.observers.notify_error(request, &error);
                Err(error)
            }
        }
    }
}

impl<E: BlockingEndpoint> BlockingEndpoint for Intercepted<E> {
    fn call(&self, request: &Self::Request) -> Result<Self::Response, Self::Error> {
        self.observers.notify_before(request);
        match self.inner.call(request) {
            Ok(response) => {
                self.observers.notify_after(request, &response);
                Ok(response)
            }
            Err(error) => {
                self.observers.notify_error(request, &error);
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Echoes the request, or fails when asked to.
    struct Echo;

    impl CallShape for Echo {
        type Request = String;
        type Response = String;
        type Error = String;
    }

    #[async_trait]
    impl Endpoint for Echo {
        async fn call(&self, request: &String) -> Result<String, String> {
            if request == "fail" {
                Err("echo failed".to_string())
            } else {
                Ok(format!("echo: {request}"))
            }
        }
    }

    struct Upper;

    impl CallShape for Upper {
        type Request = String;
        type Response = String;
        type Error = String;
    }

    impl BlockingEndpoint for Upper {
        fn call(&self, request: &String) -> Result<String, String> {
            if request.is_empty() {
                Err("empty".to_string())
            } else {
                Ok(request.to_uppercase())
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl CallObserver<String, String, String> for Recorder {
        fn before(&self, request: &String) {
            self.events.lock().unwrap().push(format!("{}:before:{request}", self.name));
        }
        fn after(&self, request: &String, response: &String) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:after:{request}->{response}", self.name));
        }
        fn on_error(&self, request: &String, error: &String) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:error:{request}:{error}", self.name));
        }
    }

    struct Panicker;

    impl CallObserver<String, String, String> for Panicker {
        fn before(&self, _request: &String) {
            panic!("observer blew up");
        }
    }

    fn recorder(name: &'static str, events: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            events: events.clone(),
        })
    }

    #[tokio::test]
    async fn before_and_after_around_success() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let wrapped = Intercepted::new(Echo);
        wrapped.register(recorder("a", &events));

        let out = wrapped.call(&"hi".to_string()).await;
        assert_eq!(out, Ok("echo: hi".to_string()));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["a:before:hi", "a:after:hi->echo: hi"]
        );
    }

    #[tokio::test]
    async fn error_is_observed_and_propagated_unchanged() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let wrapped = Intercepted::new(Echo);
        wrapped.register(recorder("a", &events));

        let out = wrapped.call(&"fail".to_string()).await;
        assert_eq!(out, Err("echo failed".to_string()));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["a:before:fail", "a:error:fail:echo failed"]
        );
    }

    #[tokio::test]
    async fn panicking_observer_does_not_affect_call() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let wrapped = Intercepted::new(Echo);
        wrapped.register(Arc::new(Panicker));
        wrapped.register(recorder("b", &events));

        let out = wrapped.call(&"x".to_string()).await;
        assert_eq!(out, Ok("echo: x".to_string()));
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn layers_compose_outermost_first() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let inner = Intercepted::new(Echo);
        inner.register(recorder("inner", &events));
        let outer = Intercepted::new(inner);
        outer.register(recorder("outer", &events));

        outer.call(&"q".to_string()).await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "outer:before:q",
                "inner:before:q",
                "inner:after:q->echo: q",
                "outer:after:q->echo: q",
            ]
        );

        // Peeling the outer layer leaves the inner observer in place.
        events.lock().unwrap().clear();
        let inner = outer.into_inner();
        inner.call(&"r".to_string()).await.unwrap();
        assert_eq!(events.lock().unwrap().len(), 2);

        let original = inner.into_inner();
        events.lock().unwrap().clear();
        original.call(&"s".to_string()).await.unwrap();
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_and_clear() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let wrapped = Intercepted::new(Echo);
        let id = wrapped.register(recorder("a", &events));
        wrapped.register(recorder("b", &events));
        assert_eq!(wrapped.observers().len(), 2);

        assert!(wrapped.unregister(id));
        assert!(!wrapped.unregister(id));
        wrapped.call(&"z".to_string()).await.unwrap();
        assert!(events.lock().unwrap().iter().all(|e| e.starts_with("b:")));

        wrapped.observers().clear();
        assert!(wrapped.observers().is_empty());
    }

    #[test]
    fn shared_observer_set_sees_late_registrations() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let set = ObserverSet::new();
        let wrapped = Intercepted::with_observers(Arc::new(Echo), set.clone());
        set.register(recorder("late", &events));

        tokio_test::block_on(async {
            wrapped.call(&"m".to_string()).await.unwrap();
        });
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn blocking_endpoints_are_intercepted_too() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let wrapped = Intercepted::new(Upper);
        wrapped.register(recorder("s", &events));

        assert_eq!(wrapped.call(&"abc".to_string()), Ok("ABC".to_string()));
        assert_eq!(wrapped.call(&String::new()), Err("empty".to_string()));
        assert_eq!(
            *events.lock().unwrap(),
            vec!["s:before:abc", "s:after:abc->ABC", "s:before:", "s:error::empty"]
        );
    }
}
