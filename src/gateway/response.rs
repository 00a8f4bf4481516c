//! Response constructors shared by the login flow, registry gateway and
//! dispatcher.

use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

/// `Cache-Control` value for every auth-sensitive response
pub const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Mark a response as uncacheable.
pub fn no_cache(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    response
}

/// Status with an empty body, uncacheable.
#[must_use]
pub fn empty(status: StatusCode) -> Response {
    no_cache((status, Body::empty()).into_response())
}

/// Navigate the browser to `target` with a script instead of a 3xx.
///
/// An HTTP redirect may be followed by a non-interactive fetch (XHR, a
/// prefetch, an embedded resource) which cannot complete a federated login.
/// A script only runs once the page is rendered in a real browsing context,
/// so the identity provider always sees an interactive navigation.
#[must_use]
pub fn script_redirect(status: StatusCode, target: &str) -> Response {
    let body = format!(
        "\n<script type=\"text/javascript\">\nwindow.location.replace({});\n</script>\n",
        js_string(target)
    );
    let mut response = no_cache((status, body).into_response());
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    response
}

/// 302 to `location`, uncacheable. Falls back to `/` when `location` is empty
/// or not a valid header value.
#[must_use]
pub fn found(location: &str) -> Response {
    let location = HeaderValue::from_str(location)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| HeaderValue::from_static("/"));
    let mut response = empty(StatusCode::FOUND);
    response.headers_mut().insert(header::LOCATION, location);
    response
}

/// Quote `value` as a JavaScript string literal that is safe inside a
/// `<script>` element.
fn js_string(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029")
}

/// Minimal HTML escaping for text interpolated into error pages.
#[must_use]
pub fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn body_string(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn script_redirect_embeds_target() {
        let response = script_redirect(StatusCode::OK, "https://idp.example.com/auth?state=1&x=2");
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), NO_CACHE);
        assert!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/html")
        );

        let body = body_string(response).await;
        assert!(body.contains(r#"window.location.replace("https://idp.example.com/auth?state=1&x=2");"#));
    }

    #[tokio::test]
    async fn script_redirect_cannot_break_out_of_script() {
        let body = body_string(script_redirect(
            StatusCode::OK,
            "\");</script><script>alert(1)</script>",
        ))
        .await;
        assert!(!body.contains("</script><script>"));
        assert!(body.contains("\\u003c/script\\u003e"));
    }

    #[test]
    fn found_defaults_to_root() {
        let response = found("");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(header::LOCATION).unwrap(), "/");

        let response = found("https://app.example.com/page");
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "https://app.example.com/page"
        );
    }

    #[test]
    fn html_escape_covers_markup() {
        assert_eq!(html_escape("<b a=\"x\">&'"), "&lt;b a=&quot;x&quot;&gt;&amp;&#39;");
    }
}
