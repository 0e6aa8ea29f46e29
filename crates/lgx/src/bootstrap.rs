//! 🏗️ IndexBootstrapper: everything that has to exist before the first bulk request.
//!
//! 🎬 *[the engine is empty. no policy. no template. no alias. somewhere, ten
//! thousand load balancer lines wait in a queue, tapping their feet.]*
//!
//! Five steps, in order, each gated by its own flag in the pipeline state:
//!
//! 1. 🛂 role mapping, when fine-grained access control is on
//! 2. 🧊 ISM policy, when any lifecycle threshold is set
//! 3. 📐 index template, unless one already exists
//! 4. 📊 saved views, for formats that have a curated bundle
//! 5. 📛 write alias plus its first concrete index
//!
//! Every step is safe to re-run. The flag is raised only after the step
//! succeeded, so a crash halfway through means the next run picks up where
//! this one fell over.

pub mod assets;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::app_config::{AppConfig, PipelineConfig};
use crate::engine::EngineClient;
use crate::error::IndexError;
use crate::lifecycle::{self, LifecycleConfig};
use crate::retry::{Remediation, RetryController};
use crate::state::{BootstrapFlag, PipelineState, StateStore, mark_flag};

/// 🔗 Date-math index names are full of `<{}>`; only these survive unescaped.
const INDEX_NAME_SAFE: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

const ROLES_MAPPING_PATH: &str = "_plugins/_security/api/rolesmapping/all_access";

/// ⚙️ `[template]` section: index settings baked into the template.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateConfig {
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// e.g. `"best_compression"`
    #[serde(default)]
    pub codec: Option<String>,
    /// e.g. `"30s"`
    #[serde(default)]
    pub refresh_interval: Option<String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            replicas: default_replicas(),
            codec: None,
            refresh_interval: None,
        }
    }
}

fn default_shards() -> u32 {
    1
}

fn default_replicas() -> u32 {
    1
}

/// ⚙️ `[bootstrap]` section: who gets mapped as a backend role.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BootstrapConfig {
    /// 🪪 the identity the pipeline runs as
    #[serde(default)]
    pub execution_role: Option<String>,
    /// 🪪 the secondary identity used by the buffer-less ingestion path
    #[serde(default)]
    pub no_buffer_role: Option<String>,
}

impl BootstrapConfig {
    fn roles(&self) -> Vec<String> {
        [&self.execution_role, &self.no_buffer_role]
            .into_iter()
            .flatten()
            .filter(|role| !role.trim().is_empty())
            .cloned()
            .collect()
    }
}

/// 🛂 Maps the pipeline's roles onto `all_access`. Doubles as the remediation
/// that the retry controller runs after a 403/409.
#[derive(Debug, Clone)]
pub struct RoleMapper {
    engine: Arc<EngineClient>,
    roles: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RoleMapping {
    #[serde(default)]
    backend_roles: Vec<String>,
    #[serde(default)]
    hosts: Vec<String>,
    #[serde(default)]
    users: Vec<String>,
}

impl RoleMapper {
    pub fn new(engine: Arc<EngineClient>, roles: Vec<String>) -> Self {
        Self { engine, roles }
    }

    /// 🛂 GET the current mapping, union our roles in, PUT it back.
    pub async fn map_roles(&self) -> Result<(), IndexError> {
        const OPERATION: &str = "role mapping";
        if self.roles.is_empty() {
            warn!("🛂 fine-grained access control is on but no roles are configured, nothing to map");
            return Ok(());
        }
        let url = self.engine.url(ROLES_MAPPING_PATH);
        let current = self
            .engine
            .execute(OPERATION, self.engine.request(Method::GET, &url))
            .await?;
        let existing = match current.status {
            404 => RoleMapping::default(),
            _ => {
                let current = current.error_for_status(OPERATION)?;
                let mut by_name: HashMap<String, RoleMapping> = current.json(OPERATION)?;
                by_name.remove("all_access").unwrap_or_default()
            }
        };
        let backend_roles: BTreeSet<String> = existing
            .backend_roles
            .into_iter()
            .chain(self.roles.iter().cloned())
            .collect();
        let body = json!({
            "backend_roles": backend_roles,
            "hosts": existing.hosts,
            "users": existing.users,
        });
        self.engine
            .execute(OPERATION, self.engine.json_request(Method::PUT, &url, &body))
            .await?
            .error_for_status(OPERATION)?;
        info!("🛂 mapped {} backend role(s) onto all_access", self.roles.len());
        Ok(())
    }
}

#[async_trait]
impl Remediation for RoleMapper {
    async fn remediate(&self) -> Result<(), IndexError> {
        self.map_roles().await
    }
}

#[derive(Debug, Deserialize)]
struct PolicyEnvelope {
    #[serde(rename = "_seq_no")]
    seq_no: i64,
    #[serde(rename = "_primary_term")]
    primary_term: i64,
}

/// 🏗️ Runs the setup sequence against one engine for one pipeline.
#[derive(Debug)]
pub struct IndexBootstrapper {
    engine: Arc<EngineClient>,
    retry: RetryController,
    store: Arc<dyn StateStore>,
    role_mapper: RoleMapper,
    pipeline: PipelineConfig,
    lifecycle: LifecycleConfig,
    template: TemplateConfig,
}

impl IndexBootstrapper {
    pub fn new(
        engine: Arc<EngineClient>,
        retry: RetryController,
        store: Arc<dyn StateStore>,
        app_config: &AppConfig,
    ) -> Self {
        let role_mapper = RoleMapper::new(engine.clone(), app_config.bootstrap.roles());
        Self {
            engine,
            retry,
            store,
            role_mapper,
            pipeline: app_config.pipeline.clone(),
            lifecycle: app_config.lifecycle.clone(),
            template: app_config.template.clone(),
        }
    }

    fn alias(&self) -> String {
        self.pipeline.index_name()
    }

    fn remediation(&self) -> Option<&dyn Remediation> {
        self.engine
            .config()
            .fine_grained_access_control
            .then_some(&self.role_mapper as &dyn Remediation)
    }

    /// 🚀 Run whatever steps are still outstanding. Returns the state after the last one.
    pub async fn run(&self) -> Result<PipelineState> {
        let mut state = self
            .store
            .load()
            .await
            .context("💀 Failed to read the pipeline state before bootstrapping")?;
        let alias = self.alias();
        info!(alias = %alias, version = state.version, "🏗️ bootstrap starting");

        if self.engine.config().fine_grained_access_control && !state.bootstrap.role_mapped {
            self.retry
                .run("role mapping", None, || self.role_mapper.map_roles())
                .await
                .context("💀 Failed to map backend roles. Does the caller have security admin rights?")?;
            state = self.mark(BootstrapFlag::RoleMapped).await?;
        }

        let thresholds = self.lifecycle.thresholds();
        if thresholds.any() && !state.bootstrap.ism_created {
            let meta = self.lifecycle.policy_meta(&self.pipeline.index_prefix);
            let document = lifecycle::policy_document(&lifecycle::compile(&thresholds), &meta);
            self.retry
                .run("ism policy", self.remediation(), || self.put_policy(&meta.policy_id, &document))
                .await
                .with_context(|| format!("💀 Failed to create ISM policy '{}'", meta.policy_id))?;
            state = self.mark(BootstrapFlag::IsmCreated).await?;
        }

        if !state.bootstrap.template_created {
            self.retry
                .run("index template", self.remediation(), || self.ensure_template(&alias))
                .await
                .with_context(|| format!("💀 Failed to create the index template for '{alias}'"))?;
            state = self.mark(BootstrapFlag::TemplateCreated).await?;
        }

        if !state.bootstrap.dashboard_imported {
            if let Some(bundle) =
                assets::saved_objects(self.pipeline.log_type, &alias, &self.lifecycle.timestamp_field)
            {
                match self.engine.dashboards_url("api/saved_objects/_bulk_create?overwrite=true") {
                    Some(url) => {
                        self.retry
                            .run("saved views", self.remediation(), || self.import_saved_views(&url, &bundle))
                            .await
                            .context("💀 Failed to import saved views into dashboards")?;
                        state = self.mark(BootstrapFlag::DashboardImported).await?;
                    }
                    None => debug!("📊 no dashboards url configured, skipping saved views"),
                }
            }
        }

        if !state.bootstrap.alias_created {
            self.retry
                .run("write alias", self.remediation(), || self.ensure_alias(&alias))
                .await
                .with_context(|| format!("💀 Failed to create the write alias '{alias}'"))?;
            state = self.mark(BootstrapFlag::AliasCreated).await?;
        }

        info!(alias = %alias, version = state.version, "✅ bootstrap complete");
        Ok(state)
    }

    async fn mark(&self, flag: BootstrapFlag) -> Result<PipelineState> {
        mark_flag(self.store.as_ref(), flag)
            .await
            .with_context(|| format!("💀 Step {flag} succeeded but recording it in the pipeline state failed"))
    }

    /// 🧊 GET first; absent → plain PUT; present → conditional PUT on seq_no/primary_term.
    async fn put_policy(&self, policy_id: &str, document: &Value) -> Result<(), IndexError> {
        const OPERATION: &str = "ism policy";
        let url = self.engine.url(&format!("_plugins/_ism/policies/{policy_id}"));
        let existing = self
            .engine
            .execute(OPERATION, self.engine.request(Method::GET, &url))
            .await?;
        let target = match existing.status {
            404 => url,
            _ => {
                let envelope: PolicyEnvelope = existing.error_for_status(OPERATION)?.json(OPERATION)?;
                debug!(seq_no = envelope.seq_no, "🧊 policy {policy_id} exists, updating conditionally");
                format!(
                    "{url}?if_seq_no={}&if_primary_term={}",
                    envelope.seq_no, envelope.primary_term
                )
            }
        };
        self.engine
            .execute(OPERATION, self.engine.json_request(Method::PUT, &target, document))
            .await?
            .error_for_status(OPERATION)?;
        info!("🧊 ISM policy {policy_id} is in place");
        Ok(())
    }

    /// 📐 The template body: patterns, settings, per-format mappings.
    pub fn template_body(&self, alias: &str) -> Value {
        let mut settings = serde_json::Map::new();
        settings.insert("index.number_of_shards".into(), json!(self.template.shards));
        settings.insert("index.number_of_replicas".into(), json!(self.template.replicas));
        if let Some(codec) = &self.template.codec {
            settings.insert("index.codec".into(), json!(codec));
        }
        if let Some(refresh) = &self.template.refresh_interval {
            settings.insert("index.refresh_interval".into(), json!(refresh));
        }
        settings.insert("plugins.index_state_management.rollover_alias".into(), json!(alias));
        json!({
            "index_patterns": [format!("{alias}-*")],
            "template": {
                "settings": settings,
                "mappings": assets::mappings(self.pipeline.log_type, &self.lifecycle.timestamp_field),
            }
        })
    }

    async fn ensure_template(&self, alias: &str) -> Result<(), IndexError> {
        const OPERATION: &str = "index template";
        let url = self.engine.url(&format!("_index_template/{alias}-template"));
        let existing = self
            .engine
            .execute(OPERATION, self.engine.request(Method::GET, &url))
            .await?;
        if existing.status != 404 {
            existing.error_for_status(OPERATION)?;
            info!("📐 template {alias}-template already exists, leaving it alone");
            return Ok(());
        }
        self.engine
            .execute(OPERATION, self.engine.json_request(Method::POST, &url, &self.template_body(alias)))
            .await?
            .error_for_status(OPERATION)?;
        info!("📐 template {alias}-template created");
        Ok(())
    }

    async fn import_saved_views(&self, url: &str, bundle: &Value) -> Result<(), IndexError> {
        const OPERATION: &str = "saved views";
        let request = self
            .engine
            .json_request(Method::POST, url, bundle)
            .header("osd-xsrf", "true");
        self.engine.execute(OPERATION, request).await?.error_for_status(OPERATION)?;
        info!("📊 saved views imported");
        Ok(())
    }

    /// 📛 `<alias-{now{fmt}}-000001>`, URL-encoded.
    pub fn first_index_path(&self, alias: &str) -> String {
        let name = format!("<{alias}-{{now{{{}}}}}-000001>", self.pipeline.index_suffix);
        utf8_percent_encode(&name, INDEX_NAME_SAFE).to_string()
    }

    async fn ensure_alias(&self, alias: &str) -> Result<(), IndexError> {
        const OPERATION: &str = "write alias";
        let existing = self
            .engine
            .execute(OPERATION, self.engine.request(Method::GET, &self.engine.url(&format!("_alias/{alias}"))))
            .await?;
        if existing.status != 404 {
            existing.error_for_status(OPERATION)?;
            info!("📛 alias {alias} already exists");
            return Ok(());
        }
        let url = self.engine.url(&self.first_index_path(alias));
        let body = json!({ "aliases": { alias: { "is_write_index": true } } });
        let created = self
            .engine
            .execute(OPERATION, self.engine.json_request(Method::PUT, &url, &body))
            .await?;
        if created.status == 400 && created.body.contains("resource_already_exists_exception") {
            info!("📛 first index for {alias} already exists, somebody beat us to it");
            return Ok(());
        }
        created.error_for_status(OPERATION)?;
        info!("📛 alias {alias} created with its first index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;
    use crate::parsers::LogFormat;
    use crate::retry::tests::instant_controller;
    use crate::state::InMemoryStateStore;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app_config(server: &MockServer, tweak: impl FnOnce(&mut AppConfig)) -> AppConfig {
        let text = format!(
            r#"
            [engine]
            url = "{uri}"
            dashboards_url = "{uri}/dashboards"

            [pipeline]
            log_type = "elb"
            index_prefix = "ALB-Logs"

            [lifecycle]
            warm_age = "30d"
            retain_age = "90d"

            [bootstrap]
            execution_role = "arn:aws:iam::123:role/pipeline"
            "#,
            uri = server.uri()
        );
        let mut config: AppConfig = toml::from_str(&text).expect("valid test config");
        tweak(&mut config);
        config
    }

    fn bootstrapper(config: &AppConfig, store: Arc<dyn StateStore>) -> IndexBootstrapper {
        let engine = Arc::new(EngineClient::new(config.engine.clone()).expect("client builds"));
        IndexBootstrapper::new(engine, instant_controller(3), store, config)
    }

    async fn mount_fresh_cluster(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/_plugins/_ism/policies/alb-logs-ism-policy"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/_plugins/_ism/policies/alb-logs-ism-policy"))
            .and(body_partial_json(json!({ "policy": { "default_state": "hot" } })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_index_template/alb-logs-template"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_index_template/alb-logs-template"))
            .and(body_partial_json(json!({ "index_patterns": ["alb-logs-*"] })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dashboards/api/saved_objects/_bulk_create"))
            .and(query_param("overwrite", "true"))
            .and(header("osd-xsrf", "true"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_alias/alb-logs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/%3Calb-logs-%7Bnow%7Byyyy-MM-dd%7D%7D-000001%3E"))
            .and(body_partial_json(json!({ "aliases": { "alb-logs": { "is_write_index": true } } })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn the_one_where_a_fresh_cluster_gets_the_full_treatment() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        mount_fresh_cluster(&server).await;
        let config = app_config(&server, |_| {});
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(10_000));

        let state = bootstrapper(&config, store.clone()).run().await?;
        assert!(!state.bootstrap.role_mapped, "fgac is off, nothing to map");
        assert!(state.bootstrap.ism_created);
        assert!(state.bootstrap.template_created);
        assert!(state.bootstrap.dashboard_imported);
        assert!(state.bootstrap.alias_created);

        // 🔁 a second run finds every flag raised and calls nobody
        let again = bootstrapper(&config, store).run().await?;
        assert_eq!(again.version, state.version);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_existing_policy_is_updated_conditionally() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_plugins/_ism/policies/alb-logs-ism-policy"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"_id":"alb-logs-ism-policy","_seq_no":7,"_primary_term":2,"policy":{}}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/_plugins/_ism/policies/alb-logs-ism-policy"))
            .and(query_param("if_seq_no", "7"))
            .and(query_param("if_primary_term", "2"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        let config = app_config(&server, |_| {});
        let bootstrapper = bootstrapper(&config, Arc::new(InMemoryStateStore::new(1)));
        let meta = config.lifecycle.policy_meta(&config.pipeline.index_prefix);
        let document = crate::render_policy(&config);
        bootstrapper.put_policy(&meta.policy_id, &document).await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_403_summons_the_role_mapper_once() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_plugins/_security/api/rolesmapping/all_access"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"all_access":{"backend_roles":["admin"],"hosts":[],"users":["root"]}}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/_plugins/_security/api/rolesmapping/all_access"))
            .and(body_partial_json(json!({
                "backend_roles": ["admin", "arn:aws:iam::123:role/pipeline"],
                "users": ["root"]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_index_template/alb-logs-template"))
            .respond_with(ResponseTemplate::new(403).set_body_string("no permissions"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_index_template/alb-logs-template"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;
        let config = app_config(&server, |c| c.engine.fine_grained_access_control = true);
        let bootstrapper = bootstrapper(&config, Arc::new(InMemoryStateStore::new(1)));
        bootstrapper
            .retry
            .run("index template", bootstrapper.remediation(), || {
                bootstrapper.ensure_template("alb-logs")
            })
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_someone_else_already_made_the_first_index() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_alias/alb-logs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":{"type":"resource_already_exists_exception","reason":"index already exists"}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;
        let config = app_config(&server, |_| {});
        bootstrapper(&config, Arc::new(InMemoryStateStore::new(1)))
            .ensure_alias("alb-logs")
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_step_leaves_its_flag_down() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_plugins/_ism/policies/alb-logs-ism-policy"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let config = app_config(&server, |_| {});
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new(1));
        let result = bootstrapper(&config, store.clone()).run().await;
        assert!(result.is_err());
        let state = store.load().await.expect("state loads");
        assert!(!state.bootstrap.ism_created);
        assert!(!state.bootstrap.template_created);
    }

    #[test]
    fn the_one_where_date_math_gets_escaped() {
        let mut config: AppConfig = toml::from_str(
            r#"
            [pipeline]
            log_type = "json"
            index_prefix = "app"
            "#,
        )
        .expect("valid test config");
        config.template.codec = Some("best_compression".into());
        let engine = Arc::new(EngineClient::new(config.engine.clone()).expect("client builds"));
        let bootstrapper =
            IndexBootstrapper::new(engine, instant_controller(1), Arc::new(InMemoryStateStore::new(1)), &config);
        assert_eq!(
            bootstrapper.first_index_path("app"),
            "%3Capp-%7Bnow%7Byyyy-MM-dd%7D%7D-000001%3E"
        );
        let body = bootstrapper.template_body("app");
        assert_eq!(body["template"]["settings"]["index.codec"], "best_compression");
        assert_eq!(body["template"]["settings"]["plugins.index_state_management.rollover_alias"], "app");
        assert_eq!(config.pipeline.log_type, LogFormat::Json);
    }
}
