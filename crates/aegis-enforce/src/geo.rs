//! Geographic restriction

use crate::constraint::ConstraintProcessor;
use aegis_core::{ConstraintSpec, DecisionContext, Error, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Constraint processor for `geo-restrict` descriptors.
///
/// The origin comes from the security enricher's geo lookup (falling back to
/// the context's declared location). An allow list admits only its members;
/// a block list rejects its members; `require_vpn` additionally demands the
/// enricher's VPN flag. Unknown origins are rejected whenever any
/// restriction is declared.
pub struct GeoRestrictor;

impl GeoRestrictor {
    /// Create the restrictor
    pub fn new() -> Self {
        Self
    }

    fn origin(ctx: &DecisionContext) -> Option<String> {
        ctx.attribute("security.geoLocation")
            .and_then(|v| v.as_str().map(str::to_string))
            .or_else(|| ctx.location.clone())
    }
}

impl Default for GeoRestrictor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConstraintProcessor for GeoRestrictor {
    fn prefixes(&self) -> &[&str] {
        &["geo-restrict"]
    }

    async fn apply(
        &self,
        spec: &ConstraintSpec,
        payload: Value,
        ctx: &DecisionContext,
    ) -> Result<Value> {
        let ConstraintSpec::GeoRestrict {
            allow,
            block,
            require_vpn,
        } = spec
        else {
            return Err(Error::constraint("geo restrictor given a foreign descriptor"));
        };

        let origin = Self::origin(ctx);

        if let Some(allowed) = allow {
            match &origin {
                Some(location) if allowed.contains(location) => {}
                Some(location) => {
                    return Err(Error::constraint(format!(
                        "origin '{}' is not in the allowed locations",
                        location
                    )));
                }
                None => {
                    return Err(Error::constraint(
                        "request origin unknown but an allow list is declared",
                    ));
                }
            }
        }

        if let Some(blocked) = block {
            match &origin {
                Some(location) if blocked.contains(location) => {
                    return Err(Error::constraint(format!(
                        "origin '{}' is blocked",
                        location
                    )));
                }
                None if allow.is_none() => {
                    return Err(Error::constraint(
                        "request origin unknown but a block list is declared",
                    ));
                }
                _ => {}
            }
        }

        if *require_vpn {
            let on_vpn = ctx
                .attribute("security.onVpn")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if !on_vpn {
                return Err(Error::constraint("vpn required for this resource"));
            }
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx_from(location: Option<&str>, on_vpn: Option<bool>) -> DecisionContext {
        let mut ctx = DecisionContext::new("a", "tools/call", "r");
        let mut bag = BTreeMap::new();
        if let Some(loc) = location {
            bag.insert("geoLocation".to_string(), json!(loc));
        }
        if let Some(vpn) = on_vpn {
            bag.insert("onVpn".to_string(), json!(vpn));
        }
        ctx.merge_attributes("security", bag);
        ctx
    }

    fn spec(
        allow: Option<Vec<&str>>,
        block: Option<Vec<&str>>,
        require_vpn: bool,
    ) -> ConstraintSpec {
        ConstraintSpec::GeoRestrict {
            allow: allow.map(|v| v.into_iter().map(str::to_string).collect()),
            block: block.map(|v| v.into_iter().map(str::to_string).collect()),
            require_vpn,
        }
    }

    #[tokio::test]
    async fn test_allow_list() {
        let geo = GeoRestrictor::new();
        let spec = spec(Some(vec!["office", "datacenter"]), None, false);

        assert!(geo
            .apply(&spec, json!({}), &ctx_from(Some("office"), None))
            .await
            .is_ok());
        assert!(geo
            .apply(&spec, json!({}), &ctx_from(Some("cafe"), None))
            .await
            .is_err());
        assert!(geo
            .apply(&spec, json!({}), &ctx_from(None, None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_block_list() {
        let geo = GeoRestrictor::new();
        let spec = spec(None, Some(vec!["embargoed"]), false);

        assert!(geo
            .apply(&spec, json!({}), &ctx_from(Some("office"), None))
            .await
            .is_ok());
        assert!(geo
            .apply(&spec, json!({}), &ctx_from(Some("embargoed"), None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_vpn_requirement() {
        let geo = GeoRestrictor::new();
        let spec = spec(None, None, true);

        assert!(geo
            .apply(&spec, json!({}), &ctx_from(Some("office"), Some(true)))
            .await
            .is_ok());
        assert!(geo
            .apply(&spec, json!({}), &ctx_from(Some("office"), Some(false)))
            .await
            .is_err());
        assert!(geo
            .apply(&spec, json!({}), &ctx_from(Some("office"), None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_declared_location_fallback() {
        let geo = GeoRestrictor::new();
        let spec = spec(Some(vec!["hq"]), None, false);

        let mut ctx = DecisionContext::new("a", "tools/call", "r");
        ctx.location = Some("hq".to_string());
        assert!(geo.apply(&spec, json!({}), &ctx).await.is_ok());
    }
}
