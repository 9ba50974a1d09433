use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Filters for `search_offers`. Unset fields are left out of the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfferQuery {
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub num_gpus: Option<u32>,
    /// Upper bound on total $/hour.
    #[serde(default)]
    pub max_dph: Option<f64>,
    /// 0.0–1.0.
    #[serde(default)]
    pub min_reliability: Option<f64>,
    #[serde(default)]
    pub min_gpu_ram_gb: Option<f64>,
    /// Mbps.
    #[serde(default)]
    pub min_inet_down: Option<f64>,
    #[serde(default = "default_true")]
    pub verified_only: bool,
    #[serde(default)]
    pub interruptible: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_true() -> bool {
    true
}

fn default_limit() -> u32 {
    20
}

impl Default for OfferQuery {
    fn default() -> Self {
        Self {
            gpu_name: None,
            num_gpus: None,
            max_dph: None,
            min_reliability: None,
            min_gpu_ram_gb: None,
            min_inet_down: None,
            verified_only: default_true(),
            interruptible: false,
            limit: default_limit(),
        }
    }
}

impl OfferQuery {
    /// Render the vendor's query document: one `{op: value}` object per
    /// field, cheapest first.
    pub fn to_json(&self) -> Value {
        let mut q = Map::new();
        q.insert("rentable".into(), json!({"eq": true}));
        q.insert("rented".into(), json!({"eq": false}));
        if self.verified_only {
            q.insert("verified".into(), json!({"eq": true}));
        }
        if let Some(name) = &self.gpu_name {
            // The CLI convention writes spaces as underscores (RTX_4090).
            q.insert("gpu_name".into(), json!({"eq": name.replace('_', " ")}));
        }
        if let Some(n) = self.num_gpus {
            q.insert("num_gpus".into(), json!({"eq": n}));
        }
        if let Some(max) = self.max_dph {
            q.insert("dph_total".into(), json!({"lte": max}));
        }
        if let Some(min) = self.min_reliability {
            q.insert("reliability2".into(), json!({"gte": min.clamp(0.0, 1.0)}));
        }
        if let Some(gb) = self.min_gpu_ram_gb {
            q.insert("gpu_ram".into(), json!({"gte": gb * 1000.0}));
        }
        if let Some(mbps) = self.min_inet_down {
            q.insert("inet_down".into(), json!({"gte": mbps}));
        }
        q.insert("order".into(), json!([["dph_total", "asc"]]));
        q.insert(
            "type".into(),
            json!(if self.interruptible { "bid" } else { "on-demand" }),
        );
        q.insert("limit".into(), json!(self.limit.clamp(1, 1000)));
        Value::Object(q)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_query_is_verified_on_demand() {
        let q = OfferQuery::default().to_json();
        assert_eq!(q["rentable"], json!({"eq": true}));
        assert_eq!(q["verified"], json!({"eq": true}));
        assert_eq!(q["type"], "on-demand");
        assert_eq!(q["limit"], 20);
        assert_eq!(q["order"], json!([["dph_total", "asc"]]));
        assert!(q.get("gpu_name").is_none());
    }

    #[test]
    fn test_filters_render_operators() {
        let q = OfferQuery {
            gpu_name: Some("RTX_4090".into()),
            num_gpus: Some(2),
            max_dph: Some(0.8),
            min_reliability: Some(1.5),
            min_gpu_ram_gb: Some(24.0),
            min_inet_down: Some(500.0),
            verified_only: false,
            interruptible: true,
            limit: 0,
        }
        .to_json();
        assert_eq!(q["gpu_name"], json!({"eq": "RTX 4090"}));
        assert_eq!(q["num_gpus"], json!({"eq": 2}));
        assert_eq!(q["dph_total"], json!({"lte": 0.8}));
        assert_eq!(q["reliability2"], json!({"gte": 1.0}));
        assert_eq!(q["gpu_ram"], json!({"gte": 24000.0}));
        assert_eq!(q["inet_down"], json!({"gte": 500.0}));
        assert!(q.get("verified").is_none());
        assert_eq!(q["type"], "bid");
        assert_eq!(q["limit"], 1);
    }
}
