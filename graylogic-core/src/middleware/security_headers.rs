//! Security headers middleware
//!
//! Applies the standard header set with
//! `tower_http::set_header::SetResponseHeaderLayer`. HSTS is sent only when
//! TLS terminates in front of us; over plain HTTP it is meaningless. The CSP
//! here is for API routes — embedded-panel asset routes would need their own
//! policy and are mounted without this layer.

use axum::http::HeaderValue;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

/// Apply the security header set to a router
pub fn apply_security_headers(app: Router, tls_enabled: bool) -> Router {
    let mut app = app
        .layer(SetResponseHeaderLayer::if_not_present(
            http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            http::header::X_XSS_PROTECTION,
            HeaderValue::from_static("0"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            http::header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("default-src 'self'"),
        ));

    if tls_enabled {
        app = app.layer(SetResponseHeaderLayer::overriding(
            http::header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=63072000; includeSubDomains"),
        ));
    }
    app
}
