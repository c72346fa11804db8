//! Configuration and secret resolution.
//!
//! Two jobs happen here before the child ever starts. Top-level fetching
//! pulls whole dictionaries from the configured env/config locations and
//! merges them; secret resolution then walks the merged maps and substitutes
//! every key carrying the resolvable marker with the value its location
//! string points at, iterating until a fixed point or the iteration cap.

pub mod format;
pub mod jsonpath;
pub mod location;
pub mod merge;
pub mod providers;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use self::format::{parse_value, stringify_env_value, ValueFormat};
use self::jsonpath::JsonPath;
use self::location::{SecretLocation, SecretProviderKind};
use self::merge::{merge_values, MergeStrategy};
use self::providers::SourceRegistry;

/// Default marker suffix on resolvable environment variable names.
pub const DEFAULT_RESOLVABLE_ENV_VAR_SUFFIX: &str = "_FOR_PROC_WRAPPER_TO_RESOLVE";

/// Default marker suffix on resolvable config property names.
pub const DEFAULT_RESOLVABLE_CONFIG_PROPERTY_SUFFIX: &str = "__to_resolve";

/// Default env var that receives the JSON-serialized resolved config.
pub const DEFAULT_ENV_VAR_NAME_FOR_CONFIG: &str = "TASK_CONFIG";

/// Default config property that receives the resolved environment.
pub const DEFAULT_CONFIG_PROPERTY_NAME_FOR_ENV: &str = "ENV";

pub const DEFAULT_MAX_RESOLUTION_DEPTH: u32 = 5;
pub const DEFAULT_MAX_RESOLUTION_ITERATIONS: u32 = 3;

/// Settings governing fetching and resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverSettings {
    /// Allow secret values to appear in debug logs
    pub log_secrets: bool,
    /// Ordered locations fetched into the environment (default format dotenv)
    pub env_locations: Vec<String>,
    /// Ordered locations fetched into the config (default format json)
    pub config_locations: Vec<String>,
    pub merge_strategy: MergeStrategy,
    /// Let resolution overwrite variables already present in the process env
    pub overwrite_env_during_resolution: bool,
    pub max_resolution_depth: u32,
    pub max_resolution_iterations: u32,
    /// Seconds a cached secret stays fresh; None caches for the whole run
    pub config_ttl: Option<u64>,
    /// Fail the run on the first resolution error instead of retaining keys
    pub fail_fast_resolution: bool,
    pub env_var_name_prefix: String,
    pub env_var_name_suffix: String,
    pub config_property_name_prefix: String,
    pub config_property_name_suffix: String,
    /// Env var that receives the resolved config as JSON; None disables
    pub env_var_name_for_config: Option<String>,
    /// Config property that receives the resolved env; None disables
    pub config_property_name_for_env: Option<String>,
    pub env_output_filename: Option<String>,
    pub env_output_format: Option<ValueFormat>,
    pub config_output_filename: Option<String>,
    pub config_output_format: Option<ValueFormat>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            log_secrets: false,
            env_locations: Vec::new(),
            config_locations: Vec::new(),
            merge_strategy: MergeStrategy::default(),
            overwrite_env_during_resolution: false,
            max_resolution_depth: DEFAULT_MAX_RESOLUTION_DEPTH,
            max_resolution_iterations: DEFAULT_MAX_RESOLUTION_ITERATIONS,
            config_ttl: None,
            fail_fast_resolution: true,
            env_var_name_prefix: String::new(),
            env_var_name_suffix: DEFAULT_RESOLVABLE_ENV_VAR_SUFFIX.to_string(),
            config_property_name_prefix: String::new(),
            config_property_name_suffix: DEFAULT_RESOLVABLE_CONFIG_PROPERTY_SUFFIX.to_string(),
            env_var_name_for_config: Some(DEFAULT_ENV_VAR_NAME_FOR_CONFIG.to_string()),
            config_property_name_for_env: Some(DEFAULT_CONFIG_PROPERTY_NAME_FOR_ENV.to_string()),
            env_output_filename: None,
            env_output_format: None,
            config_output_filename: None,
            config_output_format: None,
        }
    }
}

impl ResolverSettings {
    /// Pick the output filename/format pair for the env file, deriving the
    /// missing half the way the filename extension suggests.
    pub fn env_output(&self) -> Option<(String, ValueFormat)> {
        derive_output(
            self.env_output_filename.as_deref(),
            self.env_output_format,
            ValueFormat::Dotenv,
            ".env",
            "env.json",
            "env.yml",
        )
    }

    pub fn config_output(&self) -> Option<(String, ValueFormat)> {
        derive_output(
            self.config_output_filename.as_deref(),
            self.config_output_format,
            ValueFormat::Json,
            "config.env",
            "config.json",
            "config.yml",
        )
    }
}

fn derive_output(
    filename: Option<&str>,
    format: Option<ValueFormat>,
    fallback_format: ValueFormat,
    dotenv_name: &str,
    json_name: &str,
    yaml_name: &str,
) -> Option<(String, ValueFormat)> {
    match (filename, format) {
        (Some(name), Some(format)) => Some((name.to_string(), format)),
        (Some(name), None) => {
            let format = ValueFormat::guess_from_location(name).unwrap_or(fallback_format);
            Some((name.to_string(), format))
        }
        (None, Some(format)) => {
            let name = match format {
                ValueFormat::Dotenv => dotenv_name,
                ValueFormat::Json => json_name,
                ValueFormat::Yaml => yaml_name,
                ValueFormat::Text => return None,
            };
            Some((name.to_string(), format))
        }
        (None, None) => None,
    }
}

/// A fetched secret held for the TTL window.
#[derive(Debug, Clone)]
struct CachedSecret {
    raw: String,
    format: Option<ValueFormat>,
    fetched_at: Instant,
}

impl CachedSecret {
    fn is_stale(&self, ttl: Option<u64>) -> bool {
        match ttl {
            Some(secs) => self.fetched_at.elapsed() > Duration::from_secs(secs),
            None => false,
        }
    }
}

/// Output of a full resolution run.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    /// Flat, string-valued environment
    pub env: HashMap<String, String>,
    /// Possibly nested configuration
    pub config: Value,
    /// Marker keys whose resolution failed (kept unresolved)
    pub failed_env_names: Vec<String>,
    /// Config paths whose resolution failed
    pub failed_config_names: Vec<String>,
}

/// Resolves env and config maps against the configured secret sources.
pub struct ConfigResolver {
    settings: ResolverSettings,
    registry: SourceRegistry,
    /// Snapshot of the process environment at bootstrap
    process_env: HashMap<String, String>,
    cache: Mutex<HashMap<(SecretProviderKind, String), CachedSecret>>,
}

impl ConfigResolver {
    pub fn new(
        settings: ResolverSettings,
        registry: SourceRegistry,
        process_env: HashMap<String, String>,
    ) -> Self {
        Self {
            settings,
            registry,
            process_env,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Drop cache entries older than the TTL so the next resolution re-fetches.
    pub async fn expire_stale(&self) {
        let ttl = self.settings.config_ttl;
        let mut cache = self.cache.lock().await;
        cache.retain(|_, entry| !entry.is_stale(ttl));
    }

    /// Fetch, merge, and resolve the environment and configuration.
    pub async fn resolve(&self, initial_config: Value) -> Result<ResolvedConfig> {
        let (mut config, mut env) = self.fetch_and_merge(initial_config).await?;

        let mut failed_env_names = Vec::new();
        let mut failed_config_names = Vec::new();

        if self.settings.max_resolution_depth > 0 {
            for iteration in 0..self.settings.max_resolution_iterations {
                debug!("Starting resolution iteration {}", iteration + 1);

                // Env is flat on output, so markers are only recognized at
                // the top level.
                let env_pass = self
                    .resolve_map(env.clone(), &config, &env, true, 1)
                    .await?;
                env = env_pass.value;
                failed_env_names = env_pass.failed;

                if self.settings.fail_fast_resolution && !failed_env_names.is_empty() {
                    return Err(Error::Resolution(format!(
                        "failed to resolve environment variables: {}",
                        failed_env_names.join(", ")
                    )));
                }

                // CONFIG references inside the config resolve against the
                // pre-pass snapshot.
                let config_snapshot = config.clone();
                let config_obj = std::mem::take(&mut config);
                let config_pass = self
                    .resolve_map(config_obj, &config_snapshot, &env, false, 1)
                    .await?;
                config = config_pass.value;
                failed_config_names = config_pass.failed;

                if self.settings.fail_fast_resolution && !failed_config_names.is_empty() {
                    return Err(Error::Resolution(format!(
                        "failed to resolve config properties: {}",
                        failed_config_names.join(", ")
                    )));
                }

                if env_pass.unresolved == 0 && config_pass.unresolved == 0 {
                    break;
                }
            }
        } else {
            debug!("Resolution depth is 0, returning merged values unresolved");
        }

        let mut flat_env: HashMap<String, String> = HashMap::new();
        if let Value::Object(map) = &env {
            for (name, value) in map {
                flat_env.insert(name.clone(), stringify_env_value(value));
            }
        }

        if let Some(prop) = &self.settings.config_property_name_for_env {
            if let Value::Object(map) = &mut config {
                let env_obj: serde_json::Map<String, Value> = flat_env
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                map.insert(prop.clone(), Value::Object(env_obj));
            }
        }

        if let Some(var) = &self.settings.env_var_name_for_config {
            flat_env.insert(var.clone(), serde_json::to_string(&config)?);
        }

        Ok(ResolvedConfig {
            env: flat_env,
            config,
            failed_env_names,
            failed_config_names,
        })
    }

    /// Write the resolved env/config files, if configured. Returns the paths
    /// written so the supervisor can clean them up later.
    pub async fn write_output_files(&self, resolved: &ResolvedConfig) -> Result<Vec<String>> {
        let mut written = Vec::new();

        if let Some((filename, format)) = self.settings.env_output() {
            let env_value = Value::Object(
                resolved
                    .env
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            );
            let text = format::serialize_value(&env_value, format)?;
            tokio::fs::write(&filename, text).await?;
            info!("Wrote resolved environment to {filename}");
            written.push(filename);
        }

        if let Some((filename, format)) = self.settings.config_output() {
            let text = format::serialize_value(&resolved.config, format)?;
            tokio::fs::write(&filename, text).await?;
            info!("Wrote resolved config to {filename}");
            written.push(filename);
        }

        Ok(written)
    }

    /// Fetch each location and merge, config and env separately. The process
    /// environment is merged last so it wins over fetched values.
    async fn fetch_and_merge(&self, initial_config: Value) -> Result<(Value, Value)> {
        let mut merged_env = Value::Object(serde_json::Map::new());

        for location in &self.settings.env_locations {
            let fetched = self
                .fetch_top_level(location, ValueFormat::Dotenv)
                .await?;
            merged_env = merge_values(merged_env, fetched, self.settings.merge_strategy)?;
        }

        if let Value::Object(map) = &mut merged_env {
            for (name, value) in &self.process_env {
                map.insert(name.clone(), Value::String(value.clone()));
            }
        }

        let mut merged_config = if initial_config.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            initial_config
        };

        for location in &self.settings.config_locations {
            let fetched = self.fetch_top_level(location, ValueFormat::Json).await?;
            merged_config = merge_values(merged_config, fetched, self.settings.merge_strategy)?;
        }

        Ok((merged_config, merged_env))
    }

    /// Fetch one env/config location; the result must be a mapping.
    async fn fetch_top_level(&self, location: &str, default_format: ValueFormat) -> Result<Value> {
        let parsed = SecretLocation::parse(location)?;

        if matches!(
            parsed.provider,
            SecretProviderKind::Env | SecretProviderKind::Config
        ) {
            return Err(Error::Resolution(format!(
                "provider {} cannot be used as a top-level location",
                parsed.provider.code()
            )));
        }

        let value = self
            .fetch_location(&parsed, &Value::Null, &Value::Null, Some(default_format))
            .await?;

        match value {
            Some(v) if v.is_object() => Ok(v),
            Some(_) => Err(Error::Resolution(format!(
                "location '{location}' did not produce a mapping"
            ))),
            None => Err(Error::Resolution(format!(
                "location '{location}' has no value"
            ))),
        }
    }

    /// One resolution pass over a map, rewriting marker keys in place.
    async fn resolve_map(
        &self,
        value: Value,
        config: &Value,
        env: &Value,
        is_env: bool,
        depth: u32,
    ) -> Result<ResolvePass> {
        let mut failed = Vec::new();
        let mut unresolved = 0usize;
        let resolved = self
            .resolve_value(value, config, env, is_env, depth, &mut failed, &mut unresolved)
            .await?;
        Ok(ResolvePass {
            value: resolved,
            failed,
            unresolved,
        })
    }

    // The recursion walks arbitrarily nested values, so the future is boxed.
    fn resolve_value<'a>(
        &'a self,
        value: Value,
        config: &'a Value,
        env: &'a Value,
        is_env: bool,
        depth: u32,
        failed: &'a mut Vec<String>,
        unresolved: &'a mut usize,
    ) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
        Box::pin(async move {
            if depth > self.settings.max_resolution_depth {
                return Ok(value);
            }

            // Env maps are flat: only the top level carries markers.
            if is_env && depth > 1 {
                return Ok(value);
            }

            let (prefix, suffix) = if is_env {
                (
                    self.settings.env_var_name_prefix.as_str(),
                    self.settings.env_var_name_suffix.as_str(),
                )
            } else {
                (
                    self.settings.config_property_name_prefix.as_str(),
                    self.settings.config_property_name_suffix.as_str(),
                )
            };

            match value {
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (name, entry) in map {
                        let is_marker = !suffix.is_empty() || !prefix.is_empty();
                        let marked = is_marker
                            && name.starts_with(prefix)
                            && name.ends_with(suffix)
                            && name.len() > prefix.len() + suffix.len()
                            && entry.is_string();

                        if marked {
                            let stripped =
                                name[prefix.len()..name.len() - suffix.len()].to_string();
                            let location_str =
                                entry.as_str().unwrap_or_default().to_string();

                            match self.resolve_marker(&location_str, config, env).await {
                                Ok(Some(resolved_value)) => {
                                    // The process environment wins over
                                    // resolution unless overwriting was
                                    // requested.
                                    let exists_in_process_env =
                                        is_env && self.process_env.contains_key(&stripped);
                                    if exists_in_process_env
                                        && !self.settings.overwrite_env_during_resolution
                                    {
                                        info!(
                                            "Keeping existing environment variable '{stripped}'"
                                        );
                                    } else {
                                        let inner = self
                                            .resolve_value(
                                                resolved_value,
                                                config,
                                                env,
                                                is_env,
                                                depth + 1,
                                                failed,
                                                unresolved,
                                            )
                                            .await?;
                                        out.insert(stripped, inner);
                                    }
                                }
                                Ok(None) => {
                                    // Not found yet; keep the marker so a
                                    // later iteration can try again.
                                    *unresolved += 1;
                                    out.insert(name, entry);
                                }
                                Err(e) => {
                                    let mut msg = format!("Failed to resolve '{stripped}'");
                                    if self.settings.log_secrets {
                                        msg.push_str(&format!(" from '{location_str}'"));
                                    }
                                    warn!("{msg}: {e}");
                                    failed.push(stripped);
                                    out.insert(name, entry);
                                    if self.settings.fail_fast_resolution {
                                        return Ok(Value::Object(out));
                                    }
                                }
                            }
                        } else {
                            let inner = self
                                .resolve_value(
                                    entry,
                                    config,
                                    env,
                                    is_env,
                                    depth + 1,
                                    failed,
                                    unresolved,
                                )
                                .await?;
                            out.insert(name, inner);
                        }
                    }
                    Ok(Value::Object(out))
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        let inner = self
                            .resolve_value(
                                item,
                                config,
                                env,
                                is_env,
                                depth + 1,
                                failed,
                                unresolved,
                            )
                            .await?;
                        out.push(inner);
                    }
                    Ok(Value::Array(out))
                }
                other => Ok(other),
            }
        })
    }

    /// Resolve one marker value. `Ok(None)` means the referenced value does
    /// not exist yet (e.g. an ENV reference to a variable a later iteration
    /// may produce).
    async fn resolve_marker(
        &self,
        location_str: &str,
        config: &Value,
        env: &Value,
    ) -> Result<Option<Value>> {
        let location = SecretLocation::parse(location_str)?;
        self.fetch_location(&location, config, env, None).await
    }

    async fn fetch_location(
        &self,
        location: &SecretLocation,
        config: &Value,
        env: &Value,
        default_format: Option<ValueFormat>,
    ) -> Result<Option<Value>> {
        let (raw, parsed, hinted_format) = match location.provider {
            SecretProviderKind::Plain => (location.address.clone(), None, None),
            SecretProviderKind::Env => {
                let found = env
                    .as_object()
                    .and_then(|m| m.get(&location.address))
                    .cloned();
                match found {
                    Some(Value::String(s)) => (s, None, None),
                    Some(other) => (stringify_env_value(&other), Some(other), None),
                    None => return Ok(None),
                }
            }
            SecretProviderKind::Config => {
                let path = JsonPath::parse(&location.address)?;
                let matches = path.find(config);
                if matches.is_empty() {
                    return Ok(None);
                }
                let value = path.apply(config)?;
                (String::new(), Some(value), Some(ValueFormat::Json))
            }
            _ => {
                let (raw, hinted) = self.fetch_cached(location).await?;
                (raw, None, hinted)
            }
        };

        let format = location
            .format
            .or(hinted_format)
            .or_else(|| ValueFormat::guess_from_location(&location.address))
            .or(default_format);

        let mut parsed = parsed;
        if parsed.is_none() {
            parsed = match format {
                Some(f) => Some(parse_value(&raw, f)?),
                None => None,
            };
        }

        if location.self_transform {
            return Ok(Some(parsed.unwrap_or(Value::String(raw))));
        }

        if let Some(path_expr) = &location.json_path {
            let target = match parsed {
                Some(v) => v,
                // A transform implies the value is structured
                None => serde_json::from_str(&raw)
                    .map_err(|e| Error::Resolution(format!("value is not json: {e}")))?,
            };
            let path = JsonPath::parse(path_expr)?;
            return Ok(Some(path.apply(&target)?));
        }

        Ok(Some(parsed.unwrap_or(Value::String(raw))))
    }

    /// Fetch raw bytes through the registry, caching by `(provider, address)`.
    async fn fetch_cached(
        &self,
        location: &SecretLocation,
    ) -> Result<(String, Option<ValueFormat>)> {
        let key = location.fetch_key();

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(&key) {
                if !entry.is_stale(self.settings.config_ttl) {
                    debug!("Secret cache hit for provider {}", key.0.code());
                    return Ok((entry.raw.clone(), entry.format));
                }
            }
        }

        let source = self.registry.get(location.provider)?;
        let data = source.fetch(&location.address).await?;

        // Binary payloads that are not valid UTF-8 are carried base64-encoded
        let raw = match String::from_utf8(data.bytes.clone()) {
            Ok(s) => s,
            Err(_) => BASE64_STANDARD.encode(&data.bytes),
        };

        let format = data
            .content_type
            .as_deref()
            .and_then(ValueFormat::guess_from_mime_type)
            .or_else(|| source.default_format());

        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CachedSecret {
                raw: raw.clone(),
                format,
                fetched_at: Instant::now(),
            },
        );

        Ok((raw, format))
    }
}

struct ResolvePass {
    value: Value,
    failed: Vec<String>,
    unresolved: usize,
}
