//! Built-in HTML for conformance mode and error rendering.
//!
//! These pages are deliberately plain: the production deployments point
//! the flows at external UIs, and these built-ins exist so the server is
//! self-contained under conformance testing.

use crate::flow::respond::html_escape;

const STYLE: &str = "body{font-family:system-ui,sans-serif;max-width:26rem;margin:4rem auto;padding:0 1rem}label{display:block;margin:.75rem 0 .25rem}input{width:100%;padding:.4rem}button{margin-top:1rem;padding:.5rem 1.5rem}";

/// The direct error page, used when no trustworthy redirect URI exists.
#[must_use]
pub fn error_page(error: &str, description: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Error</title><style>{STYLE}</style></head>
<body>
<h1>Authorization error</h1>
<p><strong>{}</strong></p>
<p>{}</p>
</body>
</html>"#,
        html_escape(error),
        html_escape(description)
    )
}

/// The built-in login form.
#[must_use]
pub fn login_form(challenge_id: &str, client_name: &str, error: Option<&str>) -> String {
    let error_html = error.map_or(String::new(), |e| {
        format!(r#"<p style="color:#b00">{}</p>"#, html_escape(e))
    });
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Sign in</title><style>{STYLE}</style></head>
<body>
<h1>Sign in</h1>
<p>Continue to <strong>{}</strong></p>
{error_html}
<form method="post" action="/flow/login">
<input type="hidden" name="challenge" value="{}"/>
<label for="email">Email</label>
<input id="email" name="email" type="email" autocomplete="username" required/>
<label for="password">Password</label>
<input id="password" name="password" type="password" autocomplete="current-password" required/>
<button type="submit">Sign in</button>
</form>
</body>
</html>"#,
        html_escape(client_name),
        html_escape(challenge_id)
    )
}

/// The built-in re-authentication form.
#[must_use]
pub fn confirm_form(challenge_id: &str, client_name: &str, error: Option<&str>) -> String {
    let error_html = error.map_or(String::new(), |e| {
        format!(r#"<p style="color:#b00">{}</p>"#, html_escape(e))
    });
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Confirm it's you</title><style>{STYLE}</style></head>
<body>
<h1>Confirm it's you</h1>
<p><strong>{}</strong> asked you to re-authenticate.</p>
{error_html}
<form method="post" action="/flow/confirm">
<input type="hidden" name="challenge" value="{}"/>
<label for="password">Password</label>
<input id="password" name="password" type="password" autocomplete="current-password" required/>
<button type="submit">Confirm</button>
</form>
</body>
</html>"#,
        html_escape(client_name),
        html_escape(challenge_id)
    )
}

/// The built-in consent form.
#[must_use]
pub fn consent_form(challenge_id: &str, client_name: &str, scopes: &[&str]) -> String {
    let mut scope_list = String::new();
    for scope in scopes {
        scope_list.push_str(&format!("<li>{}</li>", html_escape(scope)));
    }
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Authorize access</title><style>{STYLE}</style></head>
<body>
<h1>Authorize access</h1>
<p><strong>{}</strong> is requesting:</p>
<ul>{scope_list}</ul>
<form method="post" action="/auth/consent">
<input type="hidden" name="challenge" value="{}"/>
<button type="submit" name="action" value="approve">Allow</button>
<button type="submit" name="action" value="deny">Deny</button>
</form>
</body>
</html>"#,
        html_escape(client_name),
        html_escape(challenge_id)
    )
}
