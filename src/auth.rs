//! Portal sign-in: credentials, a one-time token read from the webmail
//! inbox, then agency selection and the "show all" list filter.

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::accounts::{AccountConfig, InboxCredentials};
use crate::config::{PortalConfig, WebmailConfig};
use crate::error::{AuthError, SurfaceError};
use crate::session::Authenticator;
use crate::surface::{ChromiumSurface, PageDriver, RemoteSurface};

const TOKEN_POLL: std::time::Duration = std::time::Duration::from_millis(500);

/// Supplies the one-time token the portal asks for after the password step.
#[allow(async_fn_in_trait)]
pub trait TokenSource {
    async fn fetch_token(&mut self, surface: &ChromiumSurface) -> Result<String, AuthError>;
}

/// Reads the token from the newest unread message in a webmail inbox.
pub struct WebmailTokenSource {
    config: WebmailConfig,
    inbox: InboxCredentials,
}

impl WebmailTokenSource {
    pub fn new(config: WebmailConfig, inbox: InboxCredentials) -> Self {
        Self { config, inbox }
    }

    async fn read_token(&self, tab: &PageDriver) -> Result<String, SurfaceError> {
        let c = &self.config;
        let within = c.timeout();

        tab.fill(&c.user_input, &self.inbox.user, within).await?;
        tab.fill(&c.password_input, &self.inbox.password, within).await?;
        tab.click(&c.login_submit, within).await?;
        tab.wait_visible(&c.search_input, within).await?;

        if !c.search_query.is_empty() {
            tab.fill(&c.search_input, &c.search_query, within).await?;
            tab.press_enter(&c.search_input).await?;
        }

        let deadline = Instant::now() + within;
        while !tab.click_containing_all(&c.unread_rows, &c.subject_markers).await? {
            if Instant::now() >= deadline {
                return Err(SurfaceError::Timeout {
                    what: "token message".into(),
                    after_ms: c.timeout_ms,
                });
            }
            sleep(TOKEN_POLL).await;
        }

        tab.wait_visible(&c.message_frame, within).await?;
        let deadline = Instant::now() + within;
        loop {
            if let Some(token) = tab.frame_text(&c.message_frame, &c.token).await? {
                if !token.is_empty() {
                    return Ok(token);
                }
            }
            if Instant::now() >= deadline {
                return Err(SurfaceError::Timeout {
                    what: "token in message body".into(),
                    after_ms: c.timeout_ms,
                });
            }
            sleep(TOKEN_POLL).await;
        }
    }
}

impl TokenSource for WebmailTokenSource {
    async fn fetch_token(&mut self, surface: &ChromiumSurface) -> Result<String, AuthError> {
        if self.config.host.is_empty() {
            return Err(AuthError::TokenUnavailable);
        }
        info!(host = %self.config.host, "reading sign-in token from webmail");
        let tab = surface.open_tab(&self.config.host).await?;
        let token = self.read_token(&tab).await;
        tab.close().await;
        match token {
            Ok(token) => Ok(token),
            Err(e) => {
                warn!(error = %e, "webmail token lookup failed");
                Err(AuthError::TokenUnavailable)
            }
        }
    }
}

/// Signs one account into the portal.
pub struct PortalAuthenticator<T> {
    login: String,
    password: String,
    login_url: String,
    token_url: String,
    tokens: T,
}

impl<T: TokenSource> PortalAuthenticator<T> {
    pub fn new(account: &AccountConfig, portal: &PortalConfig, tokens: T) -> Self {
        Self {
            login: account.login.clone(),
            password: account.password.clone(),
            login_url: portal.login_url.clone(),
            token_url: portal.token_url.clone(),
            tokens,
        }
    }

    async fn submit_credentials(&self, surface: &mut ChromiumSurface) -> Result<(), AuthError> {
        let s = surface.selectors().clone();
        let (element, navigation) = (surface.element_timeout(), surface.navigation_timeout());
        let page = surface.driver();

        page.goto(&self.login_url, navigation).await?;
        page.fill(&s.login_input, &self.login, navigation).await?;
        page.fill(&s.password_input, &self.password, element).await?;
        page.click(&s.login_submit, element).await?;

        // A rejected password keeps the login form up with an alert.
        sleep(element).await;
        if page.is_visible(&s.login_input).await? {
            if let Some(text) = surface.observe().await?.overlay_text {
                warn!(alert = %text, "portal rejected credentials");
                return Err(AuthError::InvalidCredentials);
            }
        }
        Ok(())
    }

    async fn submit_token(&self, surface: &ChromiumSurface, token: &str) -> Result<(), AuthError> {
        let s = surface.selectors();
        let page = surface.driver();
        let navigation = surface.navigation_timeout();

        if !self.token_url.is_empty() {
            page.goto(&self.token_url, navigation).await?;
        }
        page.fill(&s.token_input, token, navigation).await?;
        page.click(&s.token_submit, surface.element_timeout()).await?;
        Ok(())
    }
}

impl<T: TokenSource> Authenticator<ChromiumSurface> for PortalAuthenticator<T> {
    async fn sign_in(&mut self, surface: &mut ChromiumSurface) -> Result<(), AuthError> {
        info!(login = %self.login, "signing in");
        self.submit_credentials(surface).await?;

        let token = self.tokens.fetch_token(surface).await?;
        debug!(len = token.len(), "token received");
        self.submit_token(surface, &token).await?;

        let navigation = surface.navigation_timeout();
        let agency = surface.selectors().agency.clone();
        surface.driver().click(&agency, navigation).await?;
        surface.show_all_rows().await?;

        let rows = surface.selectors().rows.clone();
        match surface.driver().wait_visible(&rows, navigation).await {
            Ok(()) => {
                info!(login = %self.login, "signed in");
                Ok(())
            }
            Err(SurfaceError::Timeout { .. }) => Err(AuthError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    async fn sign_out(&mut self, surface: &mut ChromiumSurface) -> Result<(), AuthError> {
        let s = surface.selectors().clone();
        let page = surface.driver();
        page.click(&s.user_menu, surface.element_timeout()).await?;
        if !page.click_by_text(&s.user_menu_items, &s.sign_out_text).await? {
            return Err(SurfaceError::ElementMissing(s.sign_out_text).into());
        }
        info!(login = %self.login, "signed out");
        Ok(())
    }
}
