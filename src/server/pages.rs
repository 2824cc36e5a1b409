//! Minimal server-rendered pages for the browser legs of the flows.
//!
//! Styling and branded templates are deliberately out of scope; these
//! pages carry exactly the form fields the protocol needs.

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>{}</title></head>\
         <body><h2>{}</h2>{}</body></html>",
        escape_html(title),
        escape_html(title),
        body
    )
}

/// Terminal error page for browser flows that cannot redirect back to the
/// client (bad client ID, bad redirect URI, expired login link).
pub fn error_page(status: StatusCode, title: &str, detail: &str) -> Response {
    let body = format!("<p>{}</p>", escape_html(detail));
    (status, Html(page(title, &body))).into_response()
}

/// Connector picker shown when several connectors are configured and the
/// client did not pin one.
pub fn connector_selection(choices: &[(String, String, String)]) -> Response {
    let mut body = String::from("<ul>");
    for (_, name, href) in choices {
        body.push_str(&format!(
            "<li><a href=\"{}\">Log in with {}</a></li>",
            escape_html(href),
            escape_html(name)
        ));
    }
    body.push_str("</ul>");
    Html(page("Log in to Varlock", &body)).into_response()
}

/// Username/password form for password connectors.
pub fn login_form(prompt: &str, state: &str, error: Option<&str>) -> Response {
    let mut body = String::new();
    if let Some(error) = error {
        body.push_str(&format!("<p><b>{}</b></p>", escape_html(error)));
    }
    body.push_str(&format!(
        "<form method=\"post\" action=\"/auth/login\">\
         <input type=\"hidden\" name=\"state\" value=\"{}\">\
         <label>{}: <input type=\"text\" name=\"login\" autofocus></label><br>\
         <label>Password: <input type=\"password\" name=\"password\"></label><br>\
         <button type=\"submit\">Log in</button></form>",
        escape_html(state),
        escape_html(prompt),
    ));
    Html(page("Log in", &body)).into_response()
}

/// Grant-access confirmation.
pub fn approval_page(client_name: &str, email: &str, req: &str, hmac: &str) -> Response {
    let body = format!(
        "<p>{} wants access to your account ({}).</p>\
         <form method=\"post\" action=\"/approval\">\
         <input type=\"hidden\" name=\"req\" value=\"{}\">\
         <input type=\"hidden\" name=\"hmac\" value=\"{}\">\
         <button type=\"submit\" name=\"approval\" value=\"approve\">Grant access</button>\
         <button type=\"submit\" name=\"approval\" value=\"reject\">Deny</button></form>",
        escape_html(client_name),
        escape_html(email),
        escape_html(req),
        escape_html(hmac),
    );
    Html(page("Grant access", &body)).into_response()
}

/// Device-flow entry page asking for the user code. The complete
/// verification URI prefills it.
pub fn device_entry(prefill: Option<&str>, error: Option<&str>) -> Response {
    let mut body = String::new();
    if let Some(error) = error {
        body.push_str(&format!("<p><b>{}</b></p>", escape_html(error)));
    }
    body.push_str(&format!(
        "<p>Enter the code displayed on your device.</p>\
         <form method=\"post\" action=\"/device/auth/verify_code\">\
         <label>Code: <input type=\"text\" name=\"user_code\" value=\"{}\" autofocus></label>\
         <button type=\"submit\">Continue</button></form>",
        escape_html(prefill.unwrap_or("")),
    ));
    Html(page("Device authorization", &body)).into_response()
}

/// Shown once the device flow completed in the browser.
pub fn device_done() -> Response {
    Html(page(
        "Device authorized",
        "<p>Login successful. You may close this window and return to your device.</p>",
    ))
    .into_response()
}
