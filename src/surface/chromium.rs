//! Chromium-backed portal driver using chromiumoxide.
//!
//! Every DOM interaction is a small script evaluated in the page, so the
//! checks the health classifier relies on (visibility, overlay text, busy
//! indicators) see the same DOM the clicks act on.

use std::path::Path;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use super::{RemoteSurface, Row, SurfaceSignals, TerminalSignal};
use crate::config::{PortalConfig, PortalSelectors};
use crate::error::{AcquisitionError, SurfaceError};

const POLL: Duration = Duration::from_millis(200);

const VISIBLE: &str =
    "const visible = el => !!el && !!(el.offsetWidth || el.offsetHeight || el.getClientRects().length);";

/// JSON literal for embedding a string into a script.
fn js(value: &str) -> String {
    serde_json::Value::from(value).to_string()
}

fn js_list(values: &[String]) -> String {
    serde_json::Value::from(values.to_vec()).to_string()
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn driver_err(e: impl std::fmt::Display) -> SurfaceError {
    SurfaceError::Driver(e.to_string())
}

fn rows_script(rows: &str, identifier: &str) -> String {
    format!(
        "(() => Array.from(document.querySelectorAll({rows})).map((tr, i) => {{ \
            const id = tr.querySelector({identifier}); \
            return id ? [i, id.textContent.trim()] : null; \
        }}).filter(x => x !== null))()",
        rows = js(rows),
        identifier = js(identifier),
    )
}

fn select_row_script(selectors: &PortalSelectors, row: &Row) -> String {
    format!(
        "(() => {{ \
            const tr = document.querySelectorAll({rows})[{index}]; \
            if (!tr) return 'missing'; \
            const id = tr.querySelector({identifier}); \
            if (!id || id.textContent.trim() !== {expected}) return 'stale'; \
            const radio = tr.querySelector({select}); \
            if (!radio) return 'no_control'; \
            radio.click(); \
            return 'ok'; \
        }})()",
        rows = js(&selectors.rows),
        index = row.index,
        identifier = js(&selectors.row_identifier),
        expected = js(&row.identifier),
        select = js(&selectors.row_select),
    )
}

fn signals_script(selectors: &PortalSelectors) -> String {
    format!(
        "(() => {{ {VISIBLE} \
            const overlay = Array.from(document.querySelectorAll({overlays})).find(visible); \
            const essentials = {essentials}.every(s => visible(document.querySelector(s))); \
            const busy = {loading}.some(s => Array.from(document.querySelectorAll(s)).some(visible)); \
            return {{ \
                overlay_text: overlay ? (overlay.innerText || '').trim() : null, \
                essentials_visible: essentials, \
                busy: busy \
            }}; \
        }})()",
        overlays = js(&selectors.overlays),
        essentials = js_list(&selectors.essentials),
        loading = js_list(&selectors.loading),
    )
}

/// One browser tab plus the bounded primitives built on it.
pub struct PageDriver {
    page: Page,
    script_timeout: Duration,
}

impl PageDriver {
    fn new(page: Page, script_timeout: Duration) -> Self {
        Self {
            page,
            script_timeout,
        }
    }

    pub async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<T, SurfaceError> {
        let result = timeout(self.script_timeout, self.page.evaluate(script))
            .await
            .map_err(|_| SurfaceError::Timeout {
                what: "script evaluation".into(),
                after_ms: millis(self.script_timeout),
            })?
            .map_err(driver_err)?;
        result
            .into_value()
            .map_err(|e| SurfaceError::Driver(format!("unexpected script result: {e}")))
    }

    pub async fn goto(&self, url: &str, within: Duration) -> Result<(), SurfaceError> {
        debug!(url, "navigating");
        timeout(within, self.page.goto(url))
            .await
            .map_err(|_| SurfaceError::Timeout {
                what: format!("navigation to {url}"),
                after_ms: millis(within),
            })?
            .map_err(driver_err)?;
        Ok(())
    }

    pub async fn reload(&self, within: Duration) -> Result<(), SurfaceError> {
        timeout(within, self.page.reload())
            .await
            .map_err(|_| SurfaceError::Timeout {
                what: "page reload".into(),
                after_ms: millis(within),
            })?
            .map_err(driver_err)?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String, SurfaceError> {
        Ok(self.page.url().await.map_err(driver_err)?.unwrap_or_default())
    }

    pub async fn is_visible(&self, selector: &str) -> Result<bool, SurfaceError> {
        self.eval(format!(
            "(() => {{ {VISIBLE} return Array.from(document.querySelectorAll({})).some(visible); }})()",
            js(selector)
        ))
        .await
    }

    /// Polls a boolean script until it yields true or `within` elapses.
    pub async fn wait_until(&self, what: &str, script: &str, within: Duration) -> Result<(), SurfaceError> {
        let deadline = Instant::now() + within;
        loop {
            if self.eval::<bool>(script.to_string()).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SurfaceError::Timeout {
                    what: what.to_string(),
                    after_ms: millis(within),
                });
            }
            sleep(POLL).await;
        }
    }

    pub async fn wait_visible(&self, selector: &str, within: Duration) -> Result<(), SurfaceError> {
        let script = format!(
            "(() => {{ {VISIBLE} return Array.from(document.querySelectorAll({})).some(visible); }})()",
            js(selector)
        );
        self.wait_until(selector, &script, within).await
    }

    /// Clicks the first visible match of `selector`.
    pub async fn click(&self, selector: &str, within: Duration) -> Result<(), SurfaceError> {
        self.wait_visible(selector, within).await?;
        let clicked: bool = self
            .eval(format!(
                "(() => {{ {VISIBLE} \
                    const el = Array.from(document.querySelectorAll({})).find(visible); \
                    if (!el) return false; el.click(); return true; }})()",
                js(selector)
            ))
            .await?;
        if clicked {
            Ok(())
        } else {
            Err(SurfaceError::ElementMissing(selector.to_string()))
        }
    }

    /// Clicks the first visible match of `selector` whose text contains `text`.
    pub async fn click_by_text(&self, selector: &str, text: &str) -> Result<bool, SurfaceError> {
        self.eval(format!(
            "(() => {{ {VISIBLE} \
                const el = Array.from(document.querySelectorAll({})) \
                    .find(e => visible(e) && (e.innerText || e.textContent || '').includes({})); \
                if (!el) return false; el.click(); return true; }})()",
            js(selector),
            js(text)
        ))
        .await
    }

    /// Like [`PageDriver::click_by_text`], requiring every one of `texts`.
    pub async fn click_containing_all(&self, selector: &str, texts: &[String]) -> Result<bool, SurfaceError> {
        self.eval(format!(
            "(() => {{ {VISIBLE} const texts = {}; \
                const el = Array.from(document.querySelectorAll({})).find(e => {{ \
                    const t = e.innerText || e.textContent || ''; \
                    return visible(e) && texts.every(x => t.includes(x)); }}); \
                if (!el) return false; el.click(); return true; }})()",
            js_list(texts),
            js(selector)
        ))
        .await
    }

    /// Types `value` into the field, replacing what was there.
    pub async fn fill(&self, selector: &str, value: &str, within: Duration) -> Result<(), SurfaceError> {
        self.wait_visible(selector, within).await?;
        self.eval::<bool>(format!(
            "(() => {{ const el = document.querySelector({}); if (el) {{ el.value = ''; }} return !!el; }})()",
            js(selector)
        ))
        .await?;
        let element = self.page.find_element(selector).await.map_err(driver_err)?;
        element.click().await.map_err(driver_err)?;
        element.type_str(value).await.map_err(driver_err)?;
        Ok(())
    }

    pub async fn press_enter(&self, selector: &str) -> Result<(), SurfaceError> {
        let element = self.page.find_element(selector).await.map_err(driver_err)?;
        element.press_key("Enter").await.map_err(driver_err)?;
        Ok(())
    }

    /// Picks the `<option>` whose text contains `text` and fires `change`.
    pub async fn select_option_by_text(&self, selector: &str, text: &str) -> Result<bool, SurfaceError> {
        self.eval(format!(
            "(() => {{ \
                const sel = document.querySelector({}); \
                if (!sel) return false; \
                const opt = Array.from(sel.options || []).find(o => o.text.includes({})); \
                if (!opt) return false; \
                sel.value = opt.value; \
                sel.dispatchEvent(new Event('change', {{ bubbles: true }})); \
                return true; }})()",
            js(selector),
            js(text)
        ))
        .await
    }

    /// Text of `selector` inside the same-origin iframe `frame`.
    pub async fn frame_text(&self, frame: &str, selector: &str) -> Result<Option<String>, SurfaceError> {
        self.eval(format!(
            "(() => {{ \
                const f = document.querySelector({}); \
                const doc = f && (f.contentDocument || (f.contentWindow && f.contentWindow.document)); \
                const el = doc && doc.querySelector({}); \
                return el ? el.textContent.trim() : null; }})()",
            js(frame),
            js(selector)
        ))
        .await
    }

    pub async fn close(self) {
        if let Err(e) = self.page.close().await {
            debug!(error = %e, "closing tab failed");
        }
    }
}

/// The portal, driven through a single Chromium tab.
pub struct ChromiumSurface {
    browser: Browser,
    handler: JoinHandle<()>,
    driver: PageDriver,
    selectors: PortalSelectors,
    element_timeout: Duration,
    navigation_timeout: Duration,
}

impl ChromiumSurface {
    /// Launches Chromium with downloads routed into `download_dir`.
    pub async fn launch(portal: &PortalConfig, download_dir: &Path) -> Result<Self, AcquisitionError> {
        std::fs::create_dir_all(download_dir)?;
        let download_dir = download_dir.canonicalize()?;

        let mut builder = BrowserConfig::builder()
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .request_timeout(portal.navigation_timeout());
        if !portal.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &portal.browser_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| AcquisitionError::Browser(format!("failed to build browser config: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AcquisitionError::Browser(format!("failed to launch Chromium: {e}")))?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "browser handler event error");
                }
            }
        });

        let downloads = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(download_dir.to_string_lossy().into_owned())
            .build()
            .map_err(AcquisitionError::Browser)?;
        browser
            .execute(downloads)
            .await
            .map_err(|e| AcquisitionError::Browser(format!("failed to route downloads: {e}")))?;

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| AcquisitionError::Browser(format!("failed to open page: {e}")))?;

        Ok(Self {
            browser,
            handler,
            driver: PageDriver::new(page, portal.element_timeout().max(Duration::from_secs(5))),
            selectors: portal.selectors.clone(),
            element_timeout: portal.element_timeout(),
            navigation_timeout: portal.navigation_timeout(),
        })
    }

    pub fn driver(&self) -> &PageDriver {
        &self.driver
    }

    pub fn selectors(&self) -> &PortalSelectors {
        &self.selectors
    }

    pub fn element_timeout(&self) -> Duration {
        self.element_timeout
    }

    pub fn navigation_timeout(&self) -> Duration {
        self.navigation_timeout
    }

    /// Opens a separate tab, e.g. for the inbox holding the sign-in token.
    pub async fn open_tab(&self, url: &str) -> Result<PageDriver, SurfaceError> {
        let page = timeout(self.navigation_timeout, self.browser.new_page(url))
            .await
            .map_err(|_| SurfaceError::Timeout {
                what: format!("new tab for {url}"),
                after_ms: millis(self.navigation_timeout),
            })?
            .map_err(driver_err)?;
        Ok(PageDriver::new(page, self.driver.script_timeout))
    }

    /// Switches the list filter to the option that shows every row.
    pub async fn show_all_rows(&self) -> Result<(), SurfaceError> {
        let s = &self.selectors;
        self.driver
            .wait_visible(&s.list_filter, self.navigation_timeout)
            .await?;
        if !self
            .driver
            .select_option_by_text(&s.list_filter, &s.list_filter_all_text)
            .await?
        {
            warn!(option = %s.list_filter_all_text, "list filter option not found");
        }
        Ok(())
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            warn!(error = %e, "closing browser failed");
        }
        let _ = self.browser.wait().await;
        self.handler.abort();
    }

    async fn wait_quiet(&self) -> Result<(), SurfaceError> {
        let script = format!(
            "(() => {{ {VISIBLE} return !{}.some(s => Array.from(document.querySelectorAll(s)).some(visible)); }})()",
            js_list(&self.selectors.loading)
        );
        self.driver
            .wait_until("loading indicators", &script, self.navigation_timeout)
            .await
    }
}

impl RemoteSurface for ChromiumSurface {
    async fn visible_rows(&mut self) -> Result<Vec<Row>, SurfaceError> {
        if self
            .driver
            .wait_visible(&self.selectors.rows, self.element_timeout)
            .await
            .is_err()
        {
            return Ok(Vec::new());
        }
        let raw: Vec<(usize, String)> = self
            .driver
            .eval(rows_script(&self.selectors.rows, &self.selectors.row_identifier))
            .await?;
        Ok(raw
            .into_iter()
            .map(|(index, identifier)| Row { index, identifier })
            .collect())
    }

    async fn select_row(&mut self, row: &Row) -> Result<(), SurfaceError> {
        let result: String = self
            .driver
            .eval(select_row_script(&self.selectors, row))
            .await?;
        match result.as_str() {
            "ok" => Ok(()),
            "stale" | "missing" => Err(SurfaceError::StaleHandle(format!(
                "row {} ({})",
                row.index, row.identifier
            ))),
            _ => Err(SurfaceError::ElementMissing(self.selectors.row_select.clone())),
        }
    }

    async fn submit(&mut self) -> Result<(), SurfaceError> {
        self.driver
            .click(&self.selectors.proceed, self.element_timeout)
            .await
    }

    async fn detect_terminal_signal(&mut self, within: Duration) -> Result<TerminalSignal, SurfaceError> {
        let deadline = Instant::now() + within;
        loop {
            if self.driver.is_visible(&self.selectors.no_obligation).await? {
                return Ok(TerminalSignal::NoObligation);
            }
            if self.driver.is_visible(&self.selectors.download).await? {
                return Ok(TerminalSignal::ArtifactAvailable);
            }
            if Instant::now() >= deadline {
                return Ok(TerminalSignal::NoSignal);
            }
            sleep(POLL).await;
        }
    }

    async fn trigger_retrieval(&mut self) -> Result<(), SurfaceError> {
        self.driver
            .click(&self.selectors.download, self.element_timeout)
            .await
    }

    async fn return_to_list(&mut self) -> Result<(), SurfaceError> {
        if self.driver.is_visible(&self.selectors.rows).await? {
            return Ok(());
        }
        self.driver
            .click(&self.selectors.back, self.element_timeout)
            .await?;
        self.show_all_rows().await?;
        self.driver
            .wait_visible(&self.selectors.rows, self.navigation_timeout)
            .await
    }

    async fn observe(&mut self) -> Result<SurfaceSignals, SurfaceError> {
        self.driver.eval(signals_script(&self.selectors)).await
    }

    async fn dismiss_overlay(&mut self) -> Result<bool, SurfaceError> {
        for selector in &self.selectors.close_buttons {
            if self.driver.is_visible(selector).await? {
                self.driver.click(selector, self.element_timeout).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn refresh(&mut self) -> Result<(), SurfaceError> {
        self.driver.reload(self.navigation_timeout).await?;
        self.wait_quiet().await
    }

    async fn current_url(&mut self) -> Result<String, SurfaceError> {
        self.driver.url().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn js_literals_escape_selectors() {
        assert_eq!(js("input[type='radio']"), r#""input[type='radio']""#);
        assert_eq!(js(r#"a"b"#), r#""a\"b""#);
        assert_eq!(js_list(&["#a".into(), ".b".into()]), r##"["#a",".b"]"##);
    }

    #[test]
    fn select_script_checks_identifier() {
        let row = Row {
            index: 3,
            identifier: "123.456-7".into(),
        };
        let script = select_row_script(&PortalSelectors::default(), &row);
        assert!(script.contains("[3]"));
        assert!(script.contains(r#""123.456-7""#));
        assert!(script.contains("'stale'"));
    }

    #[test]
    fn signals_script_covers_every_selector() {
        let selectors = PortalSelectors::default();
        let script = signals_script(&selectors);
        for s in selectors.essentials.iter().chain(&selectors.loading) {
            assert!(script.contains(&js(s)[1..js(s).len() - 1]));
        }
        assert!(script.contains("overlay_text"));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn reads_rows_from_a_rendered_table() {
        let dir = tempfile::TempDir::new().unwrap();
        let portal = PortalConfig::default();
        let mut surface = ChromiumSurface::launch(&portal, dir.path()).await.unwrap();
        surface
            .driver()
            .goto(
                "data:text/html,<table id='tbIdentificador'><tbody>\
                 <tr><td><input type='radio'></td><td><span class='IdentifierNumber'>123</span></td></tr>\
                 <tr><td><input type='radio'></td><td><span class='IdentifierNumber'>456</span></td></tr>\
                 </tbody></table>",
                Duration::from_secs(10),
            )
            .await
            .unwrap();

        let rows = surface.visible_rows().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].identifier, "456");
        surface.select_row(&rows[1]).await.unwrap();

        let stale = Row {
            index: 0,
            identifier: "999".into(),
        };
        assert!(matches!(
            surface.select_row(&stale).await,
            Err(SurfaceError::StaleHandle(_))
        ));
        surface.close().await;
    }
}
