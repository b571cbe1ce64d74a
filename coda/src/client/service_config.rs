//! The service config: a declarative JSON document delivered by the resolver
//! and consumed at resolver-update time.
//!
//! The core consumes per-method `timeout`, `waitForReady`, message size caps
//! and `retryPolicy`/`hedgingPolicy`, plus the top-level
//! `loadBalancingConfig` used to choose the LB policy. Unknown fields are
//! ignored; invalid values make the whole document invalid, in which case a
//! channel keeps its previous config.

use std::time::Duration;

use serde::Deserialize;

use crate::client::load_balancing::{ParsedJsonLbConfig, GLOBAL_LB_REGISTRY};
use crate::Code;

/// An in-memory representation of a service config.
#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    pub(crate) lb_policy: Option<LbPolicyChoice>,
    pub(crate) method_configs: Vec<MethodConfig>,
}

/// The LB policy chosen by the config: the first entry of
/// `loadBalancingConfig` whose name is present in the registry.
#[derive(Clone, Debug)]
pub(crate) struct LbPolicyChoice {
    pub(crate) name: String,
    pub(crate) config: Option<ParsedJsonLbConfig>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct MethodConfig {
    pub(crate) names: Vec<MethodName>,
    pub(crate) wait_for_ready: Option<bool>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_request_message_bytes: Option<usize>,
    pub(crate) max_response_message_bytes: Option<usize>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) hedging_policy: Option<HedgingPolicy>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct MethodName {
    pub(crate) service: String,
    pub(crate) method: Option<String>,
}

/// The per-method retry policy.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: Vec<Code>,
}

/// The per-method hedging policy.
#[derive(Clone, Debug)]
pub struct HedgingPolicy {
    pub max_attempts: u32,
    pub hedging_delay: Duration,
    pub non_fatal_status_codes: Vec<Code>,
}

impl ServiceConfig {
    /// Parses and validates a JSON service config document.
    pub fn parse(json: &str) -> Result<ServiceConfig, String> {
        let raw: RawServiceConfig =
            serde_json::from_str(json).map_err(|e| format!("invalid service config: {e}"))?;

        let lb_policy = raw.load_balancing_config.and_then(choose_lb_policy);

        let mut method_configs = Vec::new();
        for raw_mc in raw.method_config.unwrap_or_default() {
            method_configs.push(convert_method_config(raw_mc)?);
        }

        Ok(ServiceConfig {
            lb_policy,
            method_configs,
        })
    }

    /// Looks up the config for a method path (`/service/method`): an exact
    /// (service, method) entry wins over a service-wide entry, which wins
    /// over a default (empty-name) entry.
    pub(crate) fn method_config(&self, path: &str) -> Option<&MethodConfig> {
        let mut parts = path.strip_prefix('/')?.splitn(2, '/');
        let service = parts.next()?;
        let method = parts.next()?;

        let mut service_wide = None;
        let mut default = None;
        for mc in &self.method_configs {
            for name in &mc.names {
                if name.service == service {
                    match &name.method {
                        Some(m) if m == method => return Some(mc),
                        Some(_) => {}
                        None => service_wide = service_wide.or(Some(mc)),
                    }
                } else if name.service.is_empty() && name.method.is_none() {
                    default = default.or(Some(mc));
                }
            }
        }
        service_wide.or(default)
    }
}

fn choose_lb_policy(entries: Vec<serde_json::Value>) -> Option<LbPolicyChoice> {
    // loadBalancingConfig is a list of single-key objects; the first entry
    // naming a registered policy wins.
    for entry in entries {
        let obj = entry.as_object()?;
        if obj.len() != 1 {
            continue;
        }
        let (name, config) = obj.iter().next()?;
        if GLOBAL_LB_REGISTRY.get_policy(name).is_some() {
            return Some(LbPolicyChoice {
                name: name.clone(),
                config: Some(ParsedJsonLbConfig::new(config.clone())),
            });
        }
    }
    None
}

fn convert_method_config(raw: RawMethodConfig) -> Result<MethodConfig, String> {
    let names = raw
        .name
        .unwrap_or_default()
        .into_iter()
        .map(|n| MethodName {
            service: n.service.unwrap_or_default(),
            method: n.method,
        })
        .collect();

    let timeout = raw.timeout.map(|t| parse_duration(&t)).transpose()?;

    let retry_policy = raw
        .retry_policy
        .map(convert_retry_policy)
        .transpose()?;
    let hedging_policy = raw
        .hedging_policy
        .map(convert_hedging_policy)
        .transpose()?;
    if retry_policy.is_some() && hedging_policy.is_some() {
        return Err("methodConfig cannot carry both retryPolicy and hedgingPolicy".to_string());
    }

    Ok(MethodConfig {
        names,
        wait_for_ready: raw.wait_for_ready,
        timeout,
        max_request_message_bytes: raw.max_request_message_bytes,
        max_response_message_bytes: raw.max_response_message_bytes,
        retry_policy,
        hedging_policy,
    })
}

fn convert_retry_policy(raw: RawRetryPolicy) -> Result<RetryPolicy, String> {
    let max_attempts = raw.max_attempts.ok_or("retryPolicy.maxAttempts required")?;
    if max_attempts < 2 {
        return Err("retryPolicy.maxAttempts must be at least 2".to_string());
    }
    let initial_backoff =
        parse_duration(&raw.initial_backoff.ok_or("retryPolicy.initialBackoff required")?)?;
    let max_backoff = parse_duration(&raw.max_backoff.ok_or("retryPolicy.maxBackoff required")?)?;
    if initial_backoff.is_zero() || max_backoff.is_zero() {
        return Err("retryPolicy backoffs must be positive".to_string());
    }
    let backoff_multiplier = raw
        .backoff_multiplier
        .ok_or("retryPolicy.backoffMultiplier required")?;
    if backoff_multiplier <= 0.0 {
        return Err("retryPolicy.backoffMultiplier must be positive".to_string());
    }
    let codes = raw
        .retryable_status_codes
        .ok_or("retryPolicy.retryableStatusCodes required")?;
    if codes.is_empty() {
        return Err("retryPolicy.retryableStatusCodes must be non-empty".to_string());
    }
    Ok(RetryPolicy {
        max_attempts,
        initial_backoff,
        max_backoff,
        backoff_multiplier,
        retryable_status_codes: codes.iter().map(|c| parse_code(c)).collect::<Result<_, _>>()?,
    })
}

fn convert_hedging_policy(raw: RawHedgingPolicy) -> Result<HedgingPolicy, String> {
    let max_attempts = raw
        .max_attempts
        .ok_or("hedgingPolicy.maxAttempts required")?;
    if max_attempts < 2 {
        return Err("hedgingPolicy.maxAttempts must be at least 2".to_string());
    }
    let hedging_delay = raw
        .hedging_delay
        .map(|d| parse_duration(&d))
        .transpose()?
        .unwrap_or(Duration::ZERO);
    let codes = raw
        .non_fatal_status_codes
        .unwrap_or_default()
        .iter()
        .map(|c| parse_code(c))
        .collect::<Result<_, _>>()?;
    Ok(HedgingPolicy {
        max_attempts,
        hedging_delay,
        non_fatal_status_codes: codes,
    })
}

/// Parses a proto JSON duration: decimal seconds with an `s` suffix.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let digits = s
        .strip_suffix('s')
        .ok_or_else(|| format!("invalid duration {s:?}: missing 's' suffix"))?;
    let secs: f64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {s:?}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration {s:?}"));
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_code(s: &str) -> Result<Code, String> {
    let code = match s {
        "OK" => Code::Ok,
        "CANCELLED" => Code::Cancelled,
        "UNKNOWN" => Code::Unknown,
        "INVALID_ARGUMENT" => Code::InvalidArgument,
        "DEADLINE_EXCEEDED" => Code::DeadlineExceeded,
        "NOT_FOUND" => Code::NotFound,
        "ALREADY_EXISTS" => Code::AlreadyExists,
        "PERMISSION_DENIED" => Code::PermissionDenied,
        "RESOURCE_EXHAUSTED" => Code::ResourceExhausted,
        "FAILED_PRECONDITION" => Code::FailedPrecondition,
        "ABORTED" => Code::Aborted,
        "OUT_OF_RANGE" => Code::OutOfRange,
        "UNIMPLEMENTED" => Code::Unimplemented,
        "INTERNAL" => Code::Internal,
        "UNAVAILABLE" => Code::Unavailable,
        "DATA_LOSS" => Code::DataLoss,
        "UNAUTHENTICATED" => Code::Unauthenticated,
        other => return Err(format!("unknown status code name {other:?}")),
    };
    Ok(code)
}

// ===== raw serde shapes =====

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    load_balancing_config: Option<Vec<serde_json::Value>>,
    method_config: Option<Vec<RawMethodConfig>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodConfig {
    name: Option<Vec<RawMethodName>>,
    wait_for_ready: Option<bool>,
    timeout: Option<String>,
    max_request_message_bytes: Option<usize>,
    max_response_message_bytes: Option<usize>,
    retry_policy: Option<RawRetryPolicy>,
    hedging_policy: Option<RawHedgingPolicy>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodName {
    service: Option<String>,
    method: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryPolicy {
    max_attempts: Option<u32>,
    initial_backoff: Option<String>,
    max_backoff: Option<String>,
    backoff_multiplier: Option<f64>,
    retryable_status_codes: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHedgingPolicy {
    max_attempts: Option<u32>,
    hedging_delay: Option<String>,
    non_fatal_status_codes: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_method_config() {
        let config = ServiceConfig::parse(
            r#"{
              "methodConfig": [{
                "name": [{"service": "echo.Echo", "method": "UnaryEcho"}],
                "timeout": "1.5s",
                "waitForReady": true,
                "maxRequestMessageBytes": 1024
              }]
            }"#,
        )
        .unwrap();

        let mc = config.method_config("/echo.Echo/UnaryEcho").unwrap();
        assert_eq!(mc.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(mc.wait_for_ready, Some(true));
        assert_eq!(mc.max_request_message_bytes, Some(1024));
        assert!(config.method_config("/echo.Echo/Other").is_none());
    }

    #[test]
    fn method_lookup_precedence() {
        let config = ServiceConfig::parse(
            r#"{
              "methodConfig": [
                {"name": [{"service": "s"}], "timeout": "1s"},
                {"name": [{"service": "s", "method": "m"}], "timeout": "2s"},
                {"name": [{}], "timeout": "3s"}
              ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.method_config("/s/m").unwrap().timeout,
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            config.method_config("/s/other").unwrap().timeout,
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            config.method_config("/t/u").unwrap().timeout,
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn parses_retry_policy() {
        let config = ServiceConfig::parse(
            r#"{
              "methodConfig": [{
                "name": [{"service": "s"}],
                "retryPolicy": {
                  "maxAttempts": 3,
                  "initialBackoff": "0.1s",
                  "maxBackoff": "1s",
                  "backoffMultiplier": 2,
                  "retryableStatusCodes": ["UNAVAILABLE", "ABORTED"]
                }
              }]
            }"#,
        )
        .unwrap();
        let rp = config
            .method_config("/s/m")
            .unwrap()
            .retry_policy
            .as_ref()
            .unwrap();
        assert_eq!(rp.max_attempts, 3);
        assert_eq!(rp.initial_backoff, Duration::from_millis(100));
        assert_eq!(
            rp.retryable_status_codes,
            vec![Code::Unavailable, Code::Aborted]
        );
    }

    #[test]
    fn rejects_invalid_retry_policy() {
        for bad in [
            r#"{"methodConfig": [{"name": [{}], "retryPolicy": {
                "maxAttempts": 1, "initialBackoff": "0.1s", "maxBackoff": "1s",
                "backoffMultiplier": 2, "retryableStatusCodes": ["UNAVAILABLE"]}}]}"#,
            r#"{"methodConfig": [{"name": [{}], "retryPolicy": {
                "maxAttempts": 3, "initialBackoff": "0s", "maxBackoff": "1s",
                "backoffMultiplier": 2, "retryableStatusCodes": ["UNAVAILABLE"]}}]}"#,
            r#"{"methodConfig": [{"name": [{}], "retryPolicy": {
                "maxAttempts": 3, "initialBackoff": "0.1s", "maxBackoff": "1s",
                "backoffMultiplier": 2, "retryableStatusCodes": []}}]}"#,
        ] {
            assert!(ServiceConfig::parse(bad).is_err(), "should reject: {bad}");
        }
    }

    #[test]
    fn selects_first_known_lb_policy() {
        let config = ServiceConfig::parse(
            r#"{"loadBalancingConfig": [
                {"made_up_policy": {}},
                {"round_robin": {}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(config.lb_policy.as_ref().unwrap().name, "round_robin");
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(ServiceConfig::parse("{not json").is_err());
        assert!(ServiceConfig::parse(r#"{"methodConfig": [{"timeout": "abc"}]}"#).is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("0.25s").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("-1s").is_err());
    }
}
