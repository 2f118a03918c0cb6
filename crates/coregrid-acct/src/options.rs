//! Acct-gather option registry.
//!
//! The option table is a flat key/value map merged across capabilities.
//! `Frequency` and `Params` are built in; every other key must belong to
//! a configured capability. Keys match case-insensitively and are stored
//! under their registered spelling.

use std::collections::BTreeMap;

use coregrid_core::{AcctGatherConfig, AcctParam};
use thiserror::Error;
use tracing::debug;

use crate::capability::Capabilities;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("unknown acct_gather option '{0}'")]
    UnknownKey(String),

    #[error("invalid value '{value}' for acct_gather option '{key}'")]
    InvalidValue { key: String, value: String },
}

pub const FREQUENCY_KEY: &str = "Frequency";
pub const PARAMS_KEY: &str = "Params";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcctGatherOptions {
    pub frequency_secs: u64,
    pub params: Vec<AcctParam>,
    table: BTreeMap<String, String>,
}

fn parse_param(word: &str) -> Option<AcctParam> {
    match word.to_ascii_lowercase().as_str() {
        "noshare" => Some(AcctParam::NoShare),
        "usepss" => Some(AcctParam::UsePss),
        "noovermemorykill" => Some(AcctParam::NoOverMemoryKill),
        _ => None,
    }
}

impl AcctGatherOptions {
    /// Build the merged table from `pairs` and hand it to every capability.
    pub fn parse<'a>(
        pairs: impl IntoIterator<Item = (&'a str, &'a str)>,
        caps: &mut Capabilities,
    ) -> Result<Self, OptionsError> {
        let mut known: Vec<&'static str> = vec![FREQUENCY_KEY, PARAMS_KEY];
        known.extend(caps.conf_options().into_iter().map(|(_, key)| key));

        let mut table = BTreeMap::new();
        for (key, value) in pairs {
            let canonical = known
                .iter()
                .find(|k| k.eq_ignore_ascii_case(key.trim()))
                .ok_or_else(|| OptionsError::UnknownKey(key.to_string()))?;
            table.insert(canonical.to_string(), value.trim().to_string());
        }

        let mut frequency_secs = AcctGatherConfig::default().frequency_secs;
        if let Some(v) = table.get(FREQUENCY_KEY) {
            frequency_secs = v.parse().map_err(|_| OptionsError::InvalidValue {
                key: FREQUENCY_KEY.to_string(),
                value: v.clone(),
            })?;
        }
        let mut params = Vec::new();
        if let Some(v) = table.get(PARAMS_KEY) {
            for word in v.split(',').map(str::trim).filter(|w| !w.is_empty()) {
                let param = parse_param(word).ok_or_else(|| OptionsError::InvalidValue {
                    key: PARAMS_KEY.to_string(),
                    value: word.to_string(),
                })?;
                if !params.contains(&param) {
                    params.push(param);
                }
            }
        }

        caps.conf_set(&table)?;
        debug!(keys = table.len(), frequency_secs, ?params, "acct_gather options parsed");
        Ok(Self {
            frequency_secs,
            params,
            table,
        })
    }

    /// Options from a cluster configuration: the free-form table plus the
    /// typed `frequency_secs` and `params` fields, which the table may
    /// override.
    pub fn from_config(cfg: &AcctGatherConfig, caps: &mut Capabilities) -> Result<Self, OptionsError> {
        let frequency = cfg.frequency_secs.to_string();
        let params = cfg
            .params
            .iter()
            .map(|p| format!("{p:?}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut pairs: Vec<(&str, &str)> = vec![(FREQUENCY_KEY, frequency.as_str())];
        if !params.is_empty() {
            pairs.push((PARAMS_KEY, params.as_str()));
        }
        pairs.extend(cfg.options.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Self::parse(pairs, caps)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.table
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_param(&self, param: AcctParam) -> bool {
        self.params.contains(&param)
    }

    /// Effective settings: the built-in keys followed by what each
    /// capability reports.
    pub fn values(&self, caps: &Capabilities) -> Vec<(String, String)> {
        let params = self
            .params
            .iter()
            .map(|p| format!("{p:?}"))
            .collect::<Vec<_>>()
            .join(",");
        let mut out = vec![
            (FREQUENCY_KEY.to_string(), self.frequency_secs.to_string()),
            (PARAMS_KEY.to_string(), params),
        ];
        out.extend(caps.conf_values());
        out
    }
}
