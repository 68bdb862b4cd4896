use crate::{FileCache, Request, Response};

/// Produces the response to a decoded request.
///
/// A service is shared by every connection of every worker, so it gets the worker's file
/// cache passed in rather than owning one.
pub trait Service: Send + Sync + 'static {
    fn handle(&self, request: &Request, files: &mut FileCache) -> Response;
}

impl<F> Service for F
where
    F: Fn(&Request, &mut FileCache) -> Response + Send + Sync + 'static,
{
    fn handle(&self, request: &Request, files: &mut FileCache) -> Response {
        self(request, files)
    }
}
