//! Static homepage

use crate::instance::{full, InstanceResponse};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::Response;

/// Serve the homepage HTML
pub fn serve_homepage() -> InstanceResponse {
    let mut response = Response::new(full(HOMEPAGE_HTML));
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/html;charset=UTF-8"),
    );
    response
}

const HOMEPAGE_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>poolgate</title>
    <style>
        body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; max-width: 720px; margin: 3rem auto; padding: 0 1rem; color: #1f2937; }
        h1 { font-size: 1.6rem; }
        code { background: #f3f4f6; padding: 0.1rem 0.3rem; border-radius: 4px; }
        li { margin: 0.6rem 0; }
    </style>
</head>
<body>
    <h1>poolgate</h1>
    <p>Requests are routed to on-demand instances by path:</p>
    <ul>
        <li><a href="/specific/hello"><code>/specific/&lt;name&gt;</code></a>: one instance per distinct path, started on first use.</li>
        <li><a href="/lb"><code>/lb</code></a>: a random instance from the load-balanced pool.</li>
        <li><a href="/ls"><code>/ls</code></a>: the response of every pool instance, one per line.</li>
    </ul>
    <p>Instances that cannot be provisioned answer with a JSON error naming the instance and its recent diagnostic log.</p>
</body>
</html>
"##;

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;

    #[test]
    fn test_homepage_content_type() {
        let response = serve_homepage();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "text/html;charset=UTF-8"
        );
    }
}
