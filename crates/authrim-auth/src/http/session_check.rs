//! OIDC Session Management check-session iframe.
//!
//! The RP embeds this document and posts `client_id + " " + session_state`;
//! the script recomputes the hash from the (non-HttpOnly) browser-state
//! cookie and answers `changed` / `unchanged` / `error`. Everything runs
//! client-side, so the document is static apart from the cookie name.

use axum::extract::State;
use axum::response::{Html, IntoResponse, Response};

use crate::http::AppState;

/// GET `/session/check`.
pub async fn session_check(State(state): State<AppState>) -> Response {
    let cookie_name = &state.config.cookies.browser_state_cookie;
    let html = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Session check</title></head>
<body>
<script>
(function () {{
  "use strict";
  function readBrowserState() {{
    var prefix = "{cookie_name}=";
    var parts = document.cookie.split(";");
    for (var i = 0; i < parts.length; i++) {{
      var part = parts[i].trim();
      if (part.indexOf(prefix) === 0) return part.substring(prefix.length);
    }}
    return null;
  }}

  function b64url(buffer) {{
    var bytes = new Uint8Array(buffer);
    var binary = "";
    for (var i = 0; i < bytes.length; i++) binary += String.fromCharCode(bytes[i]);
    return btoa(binary).replace(/\+/g, "-").replace(/\//g, "_").replace(/=+$/, "");
  }}

  window.addEventListener("message", function (event) {{
    var parts = (event.data || "").split(" ");
    if (parts.length !== 2) {{
      event.source.postMessage("error", event.origin);
      return;
    }}
    var clientId = parts[0];
    var sessionState = parts[1];
    var dot = sessionState.lastIndexOf(".");
    if (dot < 0) {{
      event.source.postMessage("error", event.origin);
      return;
    }}
    var salt = sessionState.substring(dot + 1);
    var browserState = readBrowserState();
    if (!browserState) {{
      event.source.postMessage("changed", event.origin);
      return;
    }}
    var input = clientId + " " + event.origin + " " + browserState + " " + salt;
    crypto.subtle.digest("SHA-256", new TextEncoder().encode(input)).then(function (digest) {{
      var expected = b64url(digest) + "." + salt;
      var answer = expected === sessionState ? "unchanged" : "changed";
      event.source.postMessage(answer, event.origin);
    }}).catch(function () {{
      event.source.postMessage("error", event.origin);
    }});
  }}, false);
}})();
</script>
</body>
</html>"#
    );
    Html(html).into_response()
}
