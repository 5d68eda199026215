//! Form login against the portal's ASP.NET WebForms page.
//!
//! The login page carries anti-forgery state in hidden inputs that must be
//! echoed back with the credentials. A successful post answers with a redirect
//! and an auth cookie; a rejected one re-renders the page with a failure
//! notification.

use crate::config::{LOGIN_FIELD_PASS, LOGIN_FIELD_USER};
use crate::http::{PortalClient, PortalRequest, Transport};
use scraper::{Html, Selector};
use tracing::{error, info, warn};
use url::Url;

pub const DEFAULT_SUBMIT_NAME: &str = "ctl00$MainContent$LoginButton";
pub const SUBMIT_VALUE: &str = "Log In";
const VIEWSTATE: &str = "__VIEWSTATE";
const HIDDEN_FIELDS: [&str; 5] = [
    VIEWSTATE,
    "__EVENTVALIDATION",
    "__VIEWSTATEGENERATOR",
    "__EVENTTARGET",
    "__EVENTARGUMENT",
];
const FAILURE_SELECTOR: &str = ".failureNotification, .validation-summary-errors";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("cannot log in: __VIEWSTATE missing from {0}")]
    MissingViewState(Url),
    #[error("portal rejected the login: \"{0}\"")]
    Rejected(String),
    #[error("login request failed: {0:#}")]
    Transport(anyhow::Error),
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub status: u16,
    pub posted_to: Url,
    pub submit_name: String,
}

/// What the login page tells us, pulled out before any further awaits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoginPage {
    pub has_login_form: bool,
    pub hidden_fields: Vec<(String, String)>,
    pub submit_name: Option<String>,
}

impl LoginPage {
    pub fn parse(html: &str) -> Self {
        let document = Html::parse_document(html);
        let has_login_form = Selector::parse(&format!(r#"input[name="{LOGIN_FIELD_USER}"]"#))
            .map(|sel| document.select(&sel).next().is_some())
            .unwrap_or(false);

        let hidden_fields = HIDDEN_FIELDS
            .iter()
            .filter_map(|id| {
                let sel = Selector::parse(&format!(r#"[id="{id}"]"#)).ok()?;
                let value = document.select(&sel).next()?.value().attr("value")?;
                if value.is_empty() {
                    None
                } else {
                    Some((id.to_string(), value.to_string()))
                }
            })
            .collect();

        let submit_name = Selector::parse(r#"input[type="submit"]"#)
            .ok()
            .and_then(|sel| {
                document
                    .select(&sel)
                    .next()
                    .and_then(|el| el.value().attr("name"))
                    .map(str::to_string)
            })
            .filter(|name| !name.is_empty());

        Self {
            has_login_form,
            hidden_fields,
            submit_name,
        }
    }

    pub fn has_viewstate(&self) -> bool {
        self.hidden_fields.iter().any(|(name, _)| name == VIEWSTATE)
    }
}

/// Text of the portal's login failure banner, if it rendered one.
pub fn failure_notification(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let sel = Selector::parse(FAILURE_SELECTOR).ok()?;
    let text = document
        .select(&sel)
        .flat_map(|el| el.text())
        .collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

pub fn login_payload(
    page: &LoginPage,
    submit_name: &str,
    credentials: &Credentials,
) -> Vec<(String, String)> {
    let mut form = page.hidden_fields.clone();
    form.push((LOGIN_FIELD_USER.to_string(), credentials.username.clone()));
    form.push((LOGIN_FIELD_PASS.to_string(), credentials.password.clone()));
    form.push((submit_name.to_string(), SUBMIT_VALUE.to_string()));
    form
}

/// Run the whole handshake once. Every failure here is fatal for the run.
pub async fn login<T: Transport>(
    client: &mut PortalClient<T>,
    base_url: &Url,
    fallback_url: &Url,
    credentials: &Credentials,
) -> Result<LoginOutcome, AuthError> {
    info!(url = %base_url, "starting portal login");
    let entry = client
        .fetch_following_redirects(base_url)
        .await
        .map_err(AuthError::Transport)?;
    let mut current_url = entry.final_url;
    let mut page = LoginPage::parse(&entry.reply.body);

    if !page.has_login_form {
        info!(url = %fallback_url, "username field not found; forcing navigation to the login page");
        let forced = client
            .fetch_following_redirects(fallback_url)
            .await
            .map_err(AuthError::Transport)?;
        current_url = forced.final_url;
        page = LoginPage::parse(&forced.reply.body);
        if !page.has_login_form {
            warn!(url = %current_url, "login form still not visible after forced navigation");
        }
    }

    if !page.has_viewstate() {
        return Err(AuthError::MissingViewState(current_url));
    }

    let submit_name = match page.submit_name.as_deref() {
        Some(name) => name.to_string(),
        None => {
            warn!(
                default = DEFAULT_SUBMIT_NAME,
                "no submit button found on the login page; guessing its name"
            );
            DEFAULT_SUBMIT_NAME.to_string()
        }
    };

    info!(url = %current_url, "posting credentials");
    let request = PortalRequest::post_form(
        current_url.clone(),
        login_payload(&page, &submit_name, credentials),
    )
    .header("Referer", current_url.as_str());
    let reply = client.send(request).await.map_err(AuthError::Transport)?;
    info!(status = reply.status, "login response received");

    if reply.status == 200 {
        if let Some(message) = failure_notification(&reply.body) {
            error!(message = %message, "portal reported a login failure");
            return Err(AuthError::Rejected(message));
        }
    }

    Ok(LoginOutcome {
        status: reply.status,
        posted_to: current_url,
        submit_name,
    })
}
