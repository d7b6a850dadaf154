//! Playwright-driven control plane
//!
//! Every action is a short Node script run with `node`: it restores the
//! browser storage state saved at login, opens the virtual machine list and
//! performs one form interaction. Parameters and selectors are embedded as
//! JSON literals, never spliced into JavaScript source.
//!
//! Scripts print one JSON line on stdout, `{"ok":true,"result":...}` on
//! success or `{"ok":false,"error":"..."}` on failure.

use async_trait::async_trait;
use panelprobe_common::{
    DisplayedInstance, DisplayedStatus, InstanceId, InstanceRef, InstanceSpec, PowerState, Resize,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

use crate::control_plane::ControlPlane;
use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for Browser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chromium" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(format!("unknown browser '{}'", other)),
        }
    }
}

/// Browser and panel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    pub browser: Browser,
    pub headless: bool,

    /// How long the panel may take to answer HTTP before the run is given up
    pub startup_timeout_secs: u64,

    /// Default timeout for every page interaction
    pub action_timeout_ms: u64,

    pub selectors: PanelSelectors,
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            browser: Browser::Chromium,
            headless: true,
            startup_timeout_secs: 30,
            action_timeout_ms: 30_000,
            selectors: PanelSelectors::default(),
        }
    }
}

/// Playwright selectors for the panel pages.
///
/// `{name}` in a row selector is replaced by the instance name and `{label}`
/// in `toggle_label` by the software or firewall entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelSelectors {
    // login and navigation
    pub login_link: String,
    pub email_input: String,
    pub password_input: String,
    pub order_now: String,
    pub cart_clear: String,
    pub catalog_link: String,
    pub cloud_services_link: String,
    pub machines_link: String,

    // create and edit form
    pub create_link: String,
    pub name_input: String,
    pub os_select: String,
    pub software_button: String,
    pub toggle_label: String,
    pub use_recommended: String,
    pub vcpus_input: String,
    pub ram_input: String,
    pub disk_type_select: String,
    pub disk_size_input: String,
    pub bandwidth_input: String,
    pub hostname_input: String,
    pub root_password_input: String,
    pub public_ipv4: String,
    pub firewall_tab: String,
    pub firewall_button: String,
    pub instance_tab: String,
    pub submit_button: String,

    // machine list
    pub row_link: String,
    pub row_checkbox: String,
    pub row_status: String,
    pub row_public_address: String,
    pub power_menu: String,
    pub power_on: String,
    pub power_off: String,
    pub confirm_yes: String,
    pub destroy_action: String,
    pub destroy_confirm_input: String,

    // machine details
    pub private_address_cell: String,
    pub gateway_cell: String,
}

impl Default for PanelSelectors {
    fn default() -> Self {
        let s = |v: &str| v.to_string();
        Self {
            login_link: s("#top-nav-login-link"),
            email_input: s("xpath=//input[contains(@id, 'email')]"),
            password_input: s("xpath=//input[contains(@id, 'password')]"),
            order_now: s("xpath=//input[contains(@value, 'Order now')]"),
            cart_clear: s("xpath=//button[contains(@class, 'btn btn-primary cart-clear')]"),
            catalog_link: s("xpath=//a[contains(text(), 'Catalog')]"),
            cloud_services_link: s("text=Cloud Services"),
            machines_link: s("text=Virtual machines"),

            create_link: s("xpath=//a[contains(text(), 'Create')]"),
            name_input: s("xpath=//input[contains(@id, 'name')]"),
            os_select: s("#os"),
            software_button: s("xpath=//button[contains(@title, 'Select software')]"),
            toggle_label: s("xpath=//label[contains(text(), '{label}')]/input"),
            use_recommended: s("xpath=//input[contains(@id, 'use_recommended')]"),
            vcpus_input: s("#f_input_vcpus"),
            ram_input: s("#f_input_memory"),
            disk_type_select: s("#hdd_type_1"),
            disk_size_input: s("#f_input_hdd_1_size"),
            bandwidth_input: s("#f_input_bandwidth"),
            hostname_input: s("xpath=//input[contains(@name, 'hostname')]"),
            root_password_input: s("xpath=//input[contains(@name, 'password')]"),
            public_ipv4: s("xpath=//input[contains(@name, 'auto_floating')]"),
            firewall_tab: s("xpath=//a[contains(text(), 'Firewall rules')]"),
            firewall_button: s("xpath=//button[contains(@title, 'Select firewall templates')]"),
            instance_tab: s("xpath=//a[contains(text(), 'Instance')]"),
            submit_button: s("xpath=//button[contains(@id, 'createButton')]"),

            row_link: s("xpath=//a[contains(text(), '{name}')]"),
            row_checkbox: s("xpath=//a[contains(text(), '{name}')]/../../td/input"),
            row_status: s("xpath=//a[contains(text(), '{name}')]/../../td[contains(@class, 'status')]"),
            row_public_address: s("xpath=//a[contains(text(), '{name}')]/../../td[4]"),
            power_menu: s("xpath=//a[contains(text(), 'Power')]"),
            power_on: s("xpath=//a[contains(text(), 'Power on')]"),
            power_off: s("xpath=//a[contains(text(), 'Power off')]"),
            confirm_yes: s("xpath=//button[contains(@value, 'yes')]"),
            destroy_action: s("xpath=//a[contains(text(), 'Destroy')]"),
            destroy_confirm_input: s("xpath=//form[contains(text(), 'You are going to destroy')]/input"),

            private_address_cell: s("xpath=//td[contains(text(), 'Private IP')]/../td[2]"),
            gateway_cell: s("xpath=//td[contains(text(), 'Gateway')]/../td[2]"),
        }
    }
}

/// One panel action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Login,
    Create,
    Power,
    Reconfigure,
    Read,
    Destroy,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Login => "login",
            Action::Create => "create",
            Action::Power => "power",
            Action::Reconfigure => "reconfigure",
            Action::Read => "read",
            Action::Destroy => "destroy",
        }
    }

    fn body(&self) -> &'static str {
        match self {
            Action::Login => LOGIN_JS,
            Action::Create => CREATE_JS,
            Action::Power => POWER_JS,
            Action::Reconfigure => RECONFIGURE_JS,
            Action::Read => READ_JS,
            Action::Destroy => DESTROY_JS,
        }
    }
}

/// Row of the machine list as the read script reports it
#[derive(Debug, Clone, Default, Deserialize)]
struct RawRow {
    name: String,
    #[serde(default)]
    href: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    public_address: Option<String>,
    #[serde(default)]
    private_address: Option<String>,
    #[serde(default)]
    gateway: Option<String>,
}

impl RawRow {
    fn into_displayed(self) -> DisplayedInstance {
        let id = self
            .href
            .as_deref()
            .map(|href| href.trim_end_matches('/'))
            .and_then(|href| href.rsplit('/').next())
            .filter(|segment| !segment.is_empty())
            .map(InstanceId::new);

        DisplayedInstance {
            name: self.name,
            id,
            status: DisplayedStatus::from_text(&self.status),
            public_address: parse_address(self.public_address.as_deref()),
            private_address: parse_address(self.private_address.as_deref()),
            gateway: parse_address(self.gateway.as_deref()),
        }
    }
}

fn parse_address(text: Option<&str>) -> Option<IpAddr> {
    text.and_then(|t| t.trim().parse().ok())
}

#[derive(Debug, Deserialize)]
struct ScriptReply {
    ok: bool,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

/// [`ControlPlane`] that drives the panel's web UI through Playwright
pub struct PlaywrightControlPlane {
    base_url: String,
    config: PanelConfig,
    workdir: TempDir,
    storage_state: PathBuf,
    scripts: AtomicU64,
}

impl PlaywrightControlPlane {
    /// Log in once with the operator credentials and keep the browser state
    /// for every later action
    pub async fn connect(
        base_url: &str,
        email: &str,
        password: &str,
        config: PanelConfig,
    ) -> E2eResult<Self> {
        Self::check_playwright_installed().await?;

        let workdir = tempfile::tempdir()?;
        let storage_state = workdir.path().join("storage-state.json");
        let plane = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
            workdir,
            storage_state,
            scripts: AtomicU64::new(0),
        };

        info!("Logging in to {} as {}", plane.base_url, email);
        plane
            .run(Action::Login, json!({ "email": email, "password": password }))
            .await?;
        info!("\t...logged in");
        Ok(plane)
    }

    async fn check_playwright_installed() -> E2eResult<()> {
        let status = Command::new("npx")
            .args(["playwright", "--version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::PlaywrightNotFound),
        }
    }

    /// Build the Node script for one action
    fn build_script(&self, action: Action, params: &serde_json::Value) -> E2eResult<String> {
        let settings = json!({
            "baseUrl": self.base_url,
            "storageState": self.storage_state,
            "saveState": action == Action::Login,
            "headless": self.config.headless,
            "timeout": self.config.action_timeout_ms,
        });

        Ok(format!(
            r#"const {{ {browser} }} = require('playwright');

const settings = {settings};
const sel = {selectors};
const params = {params};

const forRow = (template) => template.split('{{name}}').join(params.name);
const forLabel = (label) => sel.toggle_label.split('{{label}}').join(label);

async function fillField(page, selector, value) {{
  const field = page.locator(selector).first();
  await field.fill('');
  await field.fill(String(value));
}}

async function setChecked(page, selector, wanted) {{
  const box = page.locator(selector).first();
  if ((await box.isChecked()) !== wanted) {{
    await box.click();
  }}
}}

async function openMachines(page) {{
  await page.goto(settings.baseUrl);
  await page.locator(sel.catalog_link).first().click();
  const cloud = page.locator(sel.cloud_services_link).first();
  if (await cloud.count() > 0) {{
    await cloud.click();
  }}
  await page.locator(sel.machines_link).first().click();
  await page.waitForLoadState('networkidle');
}}

async function selectRow(page) {{
  await setChecked(page, forRow(sel.row_checkbox), true);
}}

(async () => {{
  const browser = await {browser}.launch({{ headless: settings.headless }});
  const context = settings.saveState
    ? await browser.newContext()
    : await browser.newContext({{ storageState: settings.storageState }});
  const page = await context.newPage();
  page.setDefaultTimeout(settings.timeout);

  try {{
    const result = await (async () => {{
{body}
    }})();
    if (settings.saveState) {{
      await context.storageState({{ path: settings.storageState }});
    }}
    console.log(JSON.stringify({{ ok: true, result: result === undefined ? null : result }}));
  }} catch (error) {{
    console.log(JSON.stringify({{ ok: false, error: error.message }}));
    process.exitCode = 1;
  }} finally {{
    await browser.close();
  }}
}})();
"#,
            browser = self.config.browser.as_str(),
            settings = serde_json::to_string(&settings)?,
            selectors = serde_json::to_string(&self.config.selectors)?,
            params = serde_json::to_string(params)?,
            body = action.body(),
        ))
    }

    /// Run one action and return its result value
    async fn run(&self, action: Action, params: serde_json::Value) -> E2eResult<serde_json::Value> {
        let script = self.build_script(action, &params)?;
        let n = self.scripts.fetch_add(1, Ordering::SeqCst);
        let script_path = self.workdir.path().join(format!("{:04}-{}.js", n, action.as_str()));
        std::fs::write(&script_path, script)?;

        debug!("Running Playwright script: {}", script_path.display());

        let output = Command::new("node")
            .arg(&script_path)
            .current_dir(self.workdir.path())
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<ScriptReply>(line.trim()).ok());

        match reply {
            Some(reply) if reply.ok && output.status.success() => Ok(reply.result),
            Some(reply) => Err(E2eError::Playwright(format!(
                "{} failed: {}",
                action.as_str(),
                reply.error.unwrap_or_else(|| "no error message".to_string())
            ))),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(E2eError::Playwright(format!(
                    "{} script failed:\nstdout: {}\nstderr: {}",
                    action.as_str(),
                    stdout,
                    stderr
                )))
            }
        }
    }
}

#[async_trait]
impl ControlPlane for PlaywrightControlPlane {
    async fn create_instance(&self, spec: &InstanceSpec) -> E2eResult<()> {
        info!("Creating VM {}...", spec.name);
        let params = json!({
            "name": spec.name,
            "os": spec.os,
            "hostname": spec.hostname,
            "password": spec.password,
            "software": spec.software,
            "useRecommended": spec.use_recommended,
            "vcpus": spec.sizing.vcpus,
            "ramMib": spec.sizing.ram_mib,
            "diskType": spec.sizing.disk.kind.label(),
            "diskSizeGib": spec.sizing.disk.size_gib,
            "bandwidthMbps": spec.sizing.bandwidth_mbps,
            "publicIpv4": spec.public_ipv4,
            "firewall": spec.firewall,
        });
        self.run(Action::Create, params).await?;
        Ok(())
    }

    async fn set_power_state(&self, instance: &InstanceRef, state: PowerState) -> E2eResult<()> {
        info!("Power {} VM {}...", state, instance.name);
        let params = json!({ "name": instance.name, "on": state == PowerState::On });
        self.run(Action::Power, params).await?;
        Ok(())
    }

    async fn reconfigure(&self, instance: &InstanceRef, resize: &Resize) -> E2eResult<()> {
        info!("Reconfiguring VM {} ({})...", instance.name, resize);
        let params = json!({
            "name": instance.name,
            "id": instance.id.as_str(),
            "vcpus": resize.vcpus,
            "ramMib": resize.ram_mib,
            "diskSizeGib": resize.disk_size_gib,
            "bandwidthMbps": resize.bandwidth_mbps,
        });
        self.run(Action::Reconfigure, params).await?;
        Ok(())
    }

    async fn read_displayed_state(&self, name: &str) -> E2eResult<Option<DisplayedInstance>> {
        let value = self.run(Action::Read, read_params(name)).await?;
        if value.is_null() {
            return Ok(None);
        }
        let row: RawRow = serde_json::from_value(value)?;
        Ok(Some(row.into_displayed()))
    }

    async fn destroy_instance(&self, instance: &InstanceRef) -> E2eResult<()> {
        info!("Destroying VM {}...", instance.name);
        self.run(Action::Destroy, json!({ "name": instance.name })).await?;
        Ok(())
    }
}

/// The script opens the detail view only for rows whose status reads as on
fn read_params(name: &str) -> serde_json::Value {
    json!({ "name": name, "onStatus": DisplayedStatus::ON_TEXTS })
}

const LOGIN_JS: &str = r#"
      await page.goto(settings.baseUrl);
      await page.locator(sel.login_link).first().click();
      await page.locator(sel.email_input).first().fill(params.email);
      const password = page.locator(sel.password_input).first();
      await password.fill(params.password);
      await password.press('Enter');
      await page.waitForLoadState('networkidle');
      const order = page.locator(sel.order_now).first();
      if (await order.count() > 0) {
        await order.click();
        const clear = page.locator(sel.cart_clear).first();
        await clear.waitFor({ state: 'visible' });
        await clear.click();
      }
"#;

const CREATE_JS: &str = r#"
      await openMachines(page);
      const href = await page.locator(sel.create_link).first().getAttribute('href');
      await page.goto(new URL(href, page.url()).toString());

      await fillField(page, sel.name_input, params.name);
      await page.locator(sel.os_select).first().selectOption({ label: params.os });

      if (params.software.length > 0) {
        await page.locator(sel.software_button).first().click();
        for (const toggle of params.software) {
          await setChecked(page, forLabel(toggle.name), toggle.enabled);
        }
        await page.locator(sel.software_button).first().click();
      }

      await setChecked(page, sel.use_recommended, params.useRecommended);
      if (!params.useRecommended) {
        await fillField(page, sel.vcpus_input, params.vcpus);
        await fillField(page, sel.ram_input, params.ramMib);
        await page.locator(sel.disk_type_select).first().selectOption({ label: params.diskType });
        await fillField(page, sel.disk_size_input, params.diskSizeGib);
        if (params.bandwidthMbps !== null) {
          await fillField(page, sel.bandwidth_input, params.bandwidthMbps);
        }
      }

      if (params.hostname !== null) {
        await fillField(page, sel.hostname_input, params.hostname);
      }
      await fillField(page, sel.root_password_input, params.password);
      await setChecked(page, sel.public_ipv4, params.publicIpv4);

      if (params.firewall.length > 0) {
        await page.locator(sel.firewall_tab).first().click();
        await page.locator(sel.firewall_button).first().click();
        for (const rule of params.firewall) {
          await setChecked(page, forLabel(rule.name), rule.enabled);
        }
        await page.locator(sel.firewall_button).first().click();
        await page.locator(sel.instance_tab).first().click();
      }

      await page.locator(sel.submit_button).first().click();
      await page.waitForLoadState('networkidle');
"#;

const POWER_JS: &str = r#"
      await openMachines(page);
      await selectRow(page);
      await page.locator(sel.power_menu).first().click();
      await page.locator(params.on ? sel.power_on : sel.power_off).first().click();
      if (!params.on) {
        const yes = page.locator(sel.confirm_yes).first();
        await yes.waitFor({ state: 'visible' });
        await yes.click();
      }
"#;

const RECONFIGURE_JS: &str = r#"
      await openMachines(page);
      const listUrl = page.url().replace(/\/+$/, '');
      await page.goto(`${listUrl}/${params.id}/edit`);
      if (params.vcpus !== null) {
        await fillField(page, sel.vcpus_input, params.vcpus);
      }
      if (params.ramMib !== null) {
        await fillField(page, sel.ram_input, params.ramMib);
      }
      if (params.diskSizeGib !== null) {
        await fillField(page, sel.disk_size_input, params.diskSizeGib);
      }
      if (params.bandwidthMbps !== null) {
        await fillField(page, sel.bandwidth_input, params.bandwidthMbps);
      }
      await page.locator(sel.submit_button).first().click();
      await page.waitForLoadState('networkidle');
"#;

const READ_JS: &str = r#"
      await openMachines(page);
      const link = page.locator(forRow(sel.row_link)).first();
      if (await link.count() === 0) {
        return null;
      }
      const text = async (selector) => {
        const cell = page.locator(selector).first();
        return (await cell.count()) > 0 ? (await cell.innerText()).trim() : null;
      };
      const row = {
        name: params.name,
        href: await link.getAttribute('href'),
        status: (await text(forRow(sel.row_status))) || '',
        public_address: await text(forRow(sel.row_public_address)),
        private_address: null,
        gateway: null,
      };
      if (params.onStatus.includes(row.status.trim().toLowerCase())) {
        await link.click();
        await page.waitForLoadState('networkidle');
        row.private_address = await text(sel.private_address_cell);
        row.gateway = await text(sel.gateway_cell);
      }
      return row;
"#;

const DESTROY_JS: &str = r#"
      await openMachines(page);
      await selectRow(page);
      await page.locator(sel.destroy_action).first().click();
      const confirm = page.locator(sel.destroy_confirm_input).first();
      await confirm.fill('DESTROY');
      await confirm.press('Tab');
      await page.keyboard.press('Tab');
      await page.keyboard.press('Enter');
      await page.waitForLoadState('networkidle');
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn plane() -> PlaywrightControlPlane {
        let workdir = tempfile::tempdir().unwrap();
        let storage_state = workdir.path().join("storage-state.json");
        PlaywrightControlPlane {
            base_url: "https://panel.example.test".to_string(),
            config: PanelConfig::default(),
            workdir,
            storage_state,
            scripts: AtomicU64::new(0),
        }
    }

    #[test]
    fn test_params_are_embedded_as_json() {
        let script = plane()
            .build_script(Action::Login, &json!({ "email": "ops@example.test", "password": "it's \"x\"" }))
            .unwrap();
        assert!(script.contains(r#""password":"it's \"x\"""#));
        assert!(script.contains("require('playwright')"));
        assert!(script.contains(r#""saveState":true"#));
    }

    #[test]
    fn test_actions_reuse_saved_state() {
        let script = plane().build_script(Action::Read, &json!({ "name": "Ubuntu-1410" })).unwrap();
        assert!(script.contains(r#""saveState":false"#));
        assert!(script.contains("storageState: settings.storageState"));
        assert!(script.contains("f_input_vcpus"));
    }

    #[test]
    fn test_read_opens_details_for_every_on_status() {
        let script = plane().build_script(Action::Read, &read_params("Ubuntu-1410")).unwrap();
        assert!(script.contains(r#""onStatus":["on","running"]"#));
        assert!(script.contains("params.onStatus.includes(row.status.trim().toLowerCase())"));
        assert!(!script.contains("=== 'on'"));
        for text in DisplayedStatus::ON_TEXTS {
            assert_eq!(DisplayedStatus::from_text(text), DisplayedStatus::On);
        }
    }

    #[test]
    fn test_row_maps_to_displayed_instance() {
        let row = RawRow {
            name: "Ubuntu-1410".to_string(),
            href: Some("https://panel.example.test/cloud/machines/4711".to_string()),
            status: " On ".to_string(),
            public_address: Some("203.0.113.10".to_string()),
            private_address: Some("10.0.0.15".to_string()),
            gateway: Some("".to_string()),
        };
        let displayed = row.into_displayed();
        assert_eq!(displayed.id, Some(InstanceId::new("4711")));
        assert_eq!(displayed.status, DisplayedStatus::On);
        assert_eq!(displayed.public_address, Some("203.0.113.10".parse().unwrap()));
        assert_eq!(displayed.private_address, Some("10.0.0.15".parse().unwrap()));
        assert_eq!(displayed.gateway, None);
    }

    #[test]
    fn test_row_while_creating() {
        let row: RawRow = serde_json::from_value(json!({
            "name": "TEST_VM_01",
            "href": null,
            "status": "creating",
        }))
        .unwrap();
        let displayed = row.into_displayed();
        assert_eq!(displayed.id, None);
        assert_eq!(displayed.status, DisplayedStatus::Other("creating".to_string()));
    }

    #[test]
    fn test_browser_from_str() {
        assert_eq!("Firefox".parse::<Browser>().unwrap(), Browser::Firefox);
        assert!("lynx".parse::<Browser>().is_err());
    }
}
