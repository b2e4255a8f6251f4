use crate::http::{ResponseBody, full_body, make_error_response};
use hyper::{Response, StatusCode};

/// Answers the liveness and readiness probes shared by every admin listener.
/// Returns `None` for any other path so the caller can route it.
pub fn probe_response(path: &str, is_ready: bool) -> Option<Response<ResponseBody>> {
    let ok_body = || full_body("ok\n");

    match path {
        "/health" => Some(Response::new(ok_body())),
        "/ready" => Some(match is_ready {
            true => Response::new(ok_body()),
            false => make_error_response(StatusCode::SERVICE_UNAVAILABLE),
        }),
        _ => None,
    }
}
