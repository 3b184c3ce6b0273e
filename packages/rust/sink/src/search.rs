//! Typed search queries rendered to Solr request parameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use catalogsync_shared::{CatalogError, Result};

/// Maximum rows a single page may request.
pub const MAX_ROWS: u32 = 500;

/// Candidate count for each vector (k-NN) clause.
const KNN_TOP_K: u32 = 1000;

const FIELD_LIST: &str = "id,domain,bpp_id,city,item_id,item_currency,item_measure_quantity,\
item_measure_value,item_name,item_short_desc,item_long_desc,item_selling_price,item_mrp_price,\
item_discount_percentage,item_status,item_symbol,item_available_count,item_maximum_count,\
provider_name,provider_status,provider_geo,provider_id,provider_location_city,\
provider_location_area_code,provider_location_street,item_veg,distance:geodist()";

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// A filter query clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchFilter {
    ProviderStatus(String),
    ItemStatus(String),
    /// Match any of the given domains.
    Domains(Vec<String>),
    /// Match any of the given category ids.
    Categories(Vec<String>),
    /// Match any of the given provider names.
    ProviderNames(Vec<String>),
    SellingPrice { min: f64, max: f64 },
    DiscountPercentage { min: f64, max: f64 },
}

impl SearchFilter {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::ProviderStatus(v) | Self::ItemStatus(v) => {
                if v.trim().is_empty() {
                    return Err(CatalogError::validation("status filter must not be empty"));
                }
            }
            Self::Domains(values) | Self::Categories(values) | Self::ProviderNames(values) => {
                if values.is_empty() || values.iter().any(|v| v.trim().is_empty()) {
                    return Err(CatalogError::validation(
                        "list filters need at least one non-empty value",
                    ));
                }
            }
            Self::SellingPrice { min, max } => {
                if *min < 0.0 || min > max {
                    return Err(CatalogError::validation(format!(
                        "invalid selling price range [{min}, {max}]"
                    )));
                }
            }
            Self::DiscountPercentage { min, max } => {
                if *min < 0.0 || *max > 100.0 || min > max {
                    return Err(CatalogError::validation(format!(
                        "invalid discount range [{min}, {max}], expected within 0..=100"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Render as a single `fq` clause.
    pub fn to_fq(&self) -> String {
        match self {
            Self::ProviderStatus(v) => format!("provider_status:{}", escape_term(v)),
            Self::ItemStatus(v) => format!("item_status:{}", escape_term(v)),
            Self::Domains(values) => format!("domain_string:({})", any_of(values)),
            Self::Categories(values) => format!("item_category_id:({})", any_of(values)),
            Self::ProviderNames(values) => format!("provider_name_string:({})", any_of(values)),
            Self::SellingPrice { min, max } => format!("item_selling_price:[{min} TO {max}]"),
            Self::DiscountPercentage { min, max } => {
                format!("item_discount_percentage:[{min} TO {max}]")
            }
        }
    }
}

fn any_of(values: &[String]) -> String {
    values
        .iter()
        .map(|v| escape_term(v))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Backslash-escape Solr query syntax characters and whitespace.
pub fn escape_term(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(
            c,
            '+' | '-' | '&' | '|' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"' | '~'
                | '*' | '?' | ':' | '\\' | '/'
        ) || c.is_whitespace()
        {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ---------------------------------------------------------------------------
// Geo and sorting
// ---------------------------------------------------------------------------

/// Restrict results to providers within `radius_km` of a point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoRadius {
    pub lat: f64,
    pub lon: f64,
    pub radius_km: f64,
}

impl GeoRadius {
    pub fn validate(&self) -> Result<()> {
        if !(-90.0..=90.0).contains(&self.lat) || !(-180.0..=180.0).contains(&self.lon) {
            return Err(CatalogError::validation(format!(
                "invalid coordinates {},{}",
                self.lat, self.lon
            )));
        }
        if self.radius_km <= 0.0 {
            return Err(CatalogError::validation("radius must be greater than zero"));
        }
        Ok(())
    }

    fn point(&self) -> String {
        format!("{},{}", self.lat, self.lon)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortOrder {
    #[default]
    Relevance,
    DistanceHighToLow,
    DistanceLowToHigh,
    PriceHighToLow,
    PriceLowToHigh,
}

impl SortOrder {
    /// The `sort` parameter, or `None` for relevance ordering.
    pub fn sort_clause(&self) -> Option<&'static str> {
        match self {
            Self::Relevance => None,
            Self::DistanceHighToLow => Some("geodist() desc"),
            Self::DistanceLowToHigh => Some("geodist() asc"),
            Self::PriceHighToLow => Some("item_selling_price desc"),
            Self::PriceLowToHigh => Some("item_selling_price asc"),
        }
    }

    fn needs_geo(&self) -> bool {
        matches!(self, Self::DistanceHighToLow | Self::DistanceLowToHigh)
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Relevance => "RELEVANCE",
            Self::DistanceHighToLow => "DISTANCE_HIGH_TO_LOW",
            Self::DistanceLowToHigh => "DISTANCE_LOW_TO_HIGH",
            Self::PriceHighToLow => "PRICE_HIGH_TO_LOW",
            Self::PriceLowToHigh => "PRICE_LOW_TO_HIGH",
        })
    }
}

impl FromStr for SortOrder {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "RELEVANCE" => Ok(Self::Relevance),
            "DISTANCE_HIGH_TO_LOW" => Ok(Self::DistanceHighToLow),
            "DISTANCE_LOW_TO_HIGH" => Ok(Self::DistanceLowToHigh),
            "PRICE_HIGH_TO_LOW" => Ok(Self::PriceHighToLow),
            "PRICE_LOW_TO_HIGH" => Ok(Self::PriceLowToHigh),
            other => Err(CatalogError::validation(format!("unknown sort order '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// SearchQuery
// ---------------------------------------------------------------------------

/// A full-text plus vector product search.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    pub filters: Vec<SearchFilter>,
    pub geo: Option<GeoRadius>,
    pub sort: SortOrder,
    /// 1-based page number.
    pub page: u32,
    pub rows: u32,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            filters: Vec::new(),
            geo: None,
            sort: SortOrder::Relevance,
            page: 1,
            rows: 10,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(CatalogError::validation("search text must not be empty"));
        }
        if self.page == 0 {
            return Err(CatalogError::validation("page numbers start at 1"));
        }
        if self.rows == 0 || self.rows > MAX_ROWS {
            return Err(CatalogError::validation(format!(
                "rows must be between 1 and {MAX_ROWS}"
            )));
        }
        if let Some(geo) = &self.geo {
            geo.validate()?;
        } else if self.sort.needs_geo() {
            return Err(CatalogError::validation(format!(
                "sort order {} requires a location",
                self.sort
            )));
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(())
    }

    /// Validate and render the request parameters. `vector` is the query
    /// embedding; when present, k-NN clauses over the vector fields are added.
    pub fn to_params(&self, vector: Option<&[f32]>) -> Result<Vec<(String, String)>> {
        self.validate()?;

        let text = self.text.trim().replace('"', "\\\"");
        let term = escape_term(self.text.trim());
        let mut q = format!(
            "item_name:\"{text}\"^10 OR item_short_desc:{term}^2 OR item_long_desc:{term}^1"
        );
        if let Some(vector) = vector {
            let literal = format!(
                "[{}]",
                vector
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            for (field, boost) in [
                ("item_name_vector", 3),
                ("item_short_desc_vector", 2),
                ("item_long_desc_vector", 1),
            ] {
                q.push_str(&format!(
                    " OR {{!knn f={field} topK={KNN_TOP_K}}}{literal}^{boost}"
                ));
            }
        }

        let mut params = vec![
            ("defType".to_string(), "edismax".to_string()),
            ("q".to_string(), q),
            ("fl".to_string(), FIELD_LIST.to_string()),
            ("rows".to_string(), self.rows.to_string()),
            (
                "start".to_string(),
                ((self.page - 1) as u64 * self.rows as u64).to_string(),
            ),
            ("wt".to_string(), "json".to_string()),
        ];

        if let Some(geo) = &self.geo {
            params.push((
                "fq".to_string(),
                format!(
                    "{{!geofilt sfield=provider_geo pt={} d={}}}",
                    geo.point(),
                    geo.radius_km
                ),
            ));
            params.push(("sfield".to_string(), "provider_geo".to_string()));
            params.push(("pt".to_string(), geo.point()));
        }
        for filter in &self.filters {
            params.push(("fq".to_string(), filter.to_fq()));
        }
        if let Some(sort) = self.sort.sort_clause() {
            params.push(("sort".to_string(), sort.to_string()));
        }

        Ok(params)
    }
}

/// One page of search hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResults {
    #[serde(rename = "numFound")]
    pub num_found: u64,
    pub start: u64,
    pub docs: Vec<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Suggestions
// ---------------------------------------------------------------------------

/// Which name a suggestion completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestField {
    ItemName,
    ProviderName,
}

impl SuggestField {
    /// The tokenized suggest field, also used for grouping and highlighting.
    pub fn suggest_field(&self) -> &'static str {
        match self {
            Self::ItemName => "item_name_suggest",
            Self::ProviderName => "provider_name_suggest",
        }
    }

    fn text_field(&self) -> &'static str {
        match self {
            Self::ItemName => "item_name",
            Self::ProviderName => "provider_name",
        }
    }

    fn payload_field(&self) -> &'static str {
        match self {
            Self::ItemName => "item_name_suggester_payload_string",
            Self::ProviderName => "provider_name_suggester_payload_string",
        }
    }
}

/// Type-ahead completion over item or provider names, one hit per
/// distinct suggestion.
#[derive(Debug, Clone, PartialEq)]
pub struct SuggestQuery {
    pub text: String,
    pub field: SuggestField,
    pub geo: Option<GeoRadius>,
}

impl SuggestQuery {
    pub fn new(text: impl Into<String>, field: SuggestField) -> Self {
        Self {
            text: text.into(),
            field,
            geo: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.text.trim().is_empty() {
            return Err(CatalogError::validation("suggest text must not be empty"));
        }
        if let Some(geo) = &self.geo {
            geo.validate()?;
        }
        Ok(())
    }

    pub fn to_params(&self) -> Result<Vec<(String, String)>> {
        self.validate()?;

        let phrase = self.text.trim().replace('"', "\\\"");
        let term = escape_term(self.text.trim());
        let suggest = self.field.suggest_field();
        let q = format!(
            "{text_field}:(\"{phrase}\"^20) OR {suggest}:({term}*^10 OR \"{phrase}\"^5 OR \"{phrase}\"~1)",
            text_field = self.field.text_field(),
        );
        let fl = format!(
            "id,suggest:{suggest},text:{},payload:{}",
            self.field.text_field(),
            self.field.payload_field()
        );

        let mut params: Vec<(String, String)> = [
            ("defType", "edismax".to_string()),
            ("q", q),
            ("fl", fl),
            ("hl", "true".to_string()),
            ("hl.fl", suggest.to_string()),
            ("hl.simple.pre", "<b>".to_string()),
            ("hl.simple.post", "</b>".to_string()),
            ("group", "true".to_string()),
            ("group.field", suggest.to_string()),
            ("group.limit", "1".to_string()),
            ("wt", "json".to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        if let Some(geo) = &self.geo {
            params.push((
                "fq".to_string(),
                format!(
                    "{{!geofilt sfield=provider_geo pt={} d={}}}",
                    geo.point(),
                    geo.radius_km
                ),
            ));
            params.push(("sfield".to_string(), "provider_geo".to_string()));
            params.push(("pt".to_string(), geo.point()));
        }
        Ok(params)
    }
}

/// One completion: the highlighted suggestion when the index returned one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub id: String,
    pub suggest: String,
    pub text: String,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestions {
    /// Documents matched before grouping.
    pub matches: u64,
    pub docs: Vec<Suggestion>,
}

impl Suggestions {
    /// Flatten a grouped select response: the top document of each group,
    /// with highlighting merged into `suggest`.
    pub fn from_response(field: SuggestField, body: &serde_json::Value) -> Self {
        let group_key = field.suggest_field();
        let grouped = &body["grouped"][group_key];
        let highlighting = &body["highlighting"];

        let docs = grouped["groups"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|group| {
                let doc = group["doclist"]["docs"].get(0)?;
                let id = text_of(&doc["id"])?;
                let suggest = text_of(&highlighting[id.as_str()][group_key])
                    .or_else(|| text_of(&doc["suggest"]))
                    .unwrap_or_default();
                Some(Suggestion {
                    suggest,
                    text: text_of(&doc["text"]).unwrap_or_default(),
                    payload: text_of(&doc["payload"]),
                    id,
                })
            })
            .collect();

        Self {
            matches: grouped["matches"].as_u64().unwrap_or(0),
            docs,
        }
    }
}

/// A string value, or the first string of a multi-valued field.
fn text_of(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(values) => values.first().and_then(text_of),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values<'a>(params: &'a [(String, String)], key: &str) -> Vec<&'a str> {
        params
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn renders_filters_and_paging() {
        let mut query = SearchQuery::new("mango");
        query.filters = vec![
            SearchFilter::ProviderStatus("enable".into()),
            SearchFilter::Domains(vec!["ONDC:RET10".into(), "ONDC:RET11".into()]),
            SearchFilter::SellingPrice {
                min: 10.0,
                max: 250.5,
            },
        ];
        query.page = 3;
        query.rows = 20;

        let params = query.to_params(None).unwrap();
        assert_eq!(values(&params, "start"), vec!["40"]);
        assert_eq!(values(&params, "rows"), vec!["20"]);
        assert_eq!(
            values(&params, "fq"),
            vec![
                "provider_status:enable",
                r"domain_string:(ONDC\:RET10 OR ONDC\:RET11)",
                "item_selling_price:[10 TO 250.5]",
            ]
        );
        assert!(values(&params, "sort").is_empty());
        assert!(!values(&params, "q")[0].contains("knn"));
    }

    #[test]
    fn renders_geo_sort_and_vectors() {
        let mut query = SearchQuery::new("dosa");
        query.geo = Some(GeoRadius {
            lat: 12.97,
            lon: 77.59,
            radius_km: 5.0,
        });
        query.sort = SortOrder::DistanceLowToHigh;

        let params = query.to_params(Some(&[0.5, -0.25])).unwrap();
        assert_eq!(
            values(&params, "fq"),
            vec!["{!geofilt sfield=provider_geo pt=12.97,77.59 d=5}"]
        );
        assert_eq!(values(&params, "sort"), vec!["geodist() asc"]);
        assert_eq!(values(&params, "pt"), vec!["12.97,77.59"]);
        let q = values(&params, "q")[0];
        assert!(q.contains("{!knn f=item_name_vector topK=1000}[0.5,-0.25]^3"));
    }

    #[test]
    fn rejects_invalid_queries() {
        let mut query = SearchQuery::new("tea");
        query.filters = vec![SearchFilter::DiscountPercentage {
            min: 10.0,
            max: 120.0,
        }];
        assert!(query.to_params(None).is_err());

        let mut query = SearchQuery::new("tea");
        query.filters = vec![SearchFilter::SellingPrice {
            min: 50.0,
            max: 10.0,
        }];
        assert!(query.validate().is_err());

        let mut query = SearchQuery::new("tea");
        query.sort = SortOrder::DistanceHighToLow;
        assert!(query.validate().is_err());

        let mut query = SearchQuery::new("tea");
        query.page = 0;
        assert!(query.validate().is_err());

        assert!(SearchQuery::new("  ").validate().is_err());
        assert!(
            SearchQuery {
                filters: vec![SearchFilter::Categories(vec![])],
                ..SearchQuery::new("tea")
            }
            .validate()
            .is_err()
        );
    }

    #[test]
    fn sort_order_parsing() {
        assert_eq!(
            "price-high-to-low".parse::<SortOrder>().unwrap(),
            SortOrder::PriceHighToLow
        );
        assert_eq!(SortOrder::PriceLowToHigh.to_string(), "PRICE_LOW_TO_HIGH");
        assert!("CHEAPEST".parse::<SortOrder>().is_err());
    }

    #[test]
    fn renders_grouped_suggest_params() {
        let mut query = SuggestQuery::new("alph", SuggestField::ItemName);
        query.geo = Some(GeoRadius {
            lat: 12.97,
            lon: 77.59,
            radius_km: 3.0,
        });

        let params = query.to_params().unwrap();
        let q = values(&params, "q")[0];
        assert!(q.starts_with("item_name:(\"alph\"^20)"), "{q}");
        assert!(q.contains("item_name_suggest:(alph*^10"));
        assert_eq!(values(&params, "group.field"), vec!["item_name_suggest"]);
        assert_eq!(values(&params, "hl.fl"), vec!["item_name_suggest"]);
        assert_eq!(
            values(&params, "fl"),
            vec!["id,suggest:item_name_suggest,text:item_name,payload:item_name_suggester_payload_string"]
        );
        assert_eq!(
            values(&params, "fq"),
            vec!["{!geofilt sfield=provider_geo pt=12.97,77.59 d=3}"]
        );

        assert!(SuggestQuery::new(" ", SuggestField::ProviderName).to_params().is_err());
    }

    #[test]
    fn flattens_groups_and_merges_highlighting() {
        let body = serde_json::json!({
            "grouped": {"provider_name_suggest": {
                "matches": 7,
                "groups": [
                    {"groupValue": "fresh", "doclist": {"docs": [{
                        "id": "a", "suggest": "Fresh Farms", "text": "Fresh Farms",
                        "payload": ["https://cdn/store.png | Fresh Farms"]
                    }]}},
                    {"groupValue": "fruit", "doclist": {"docs": [{
                        "id": "b", "suggest": "Fruit Hub", "text": "Fruit Hub"
                    }]}},
                    {"groupValue": "empty", "doclist": {"docs": []}}
                ]
            }},
            "highlighting": {"a": {"provider_name_suggest": ["<b>Fre</b>sh Farms"]}}
        });

        let suggestions = Suggestions::from_response(SuggestField::ProviderName, &body);
        assert_eq!(suggestions.matches, 7);
        assert_eq!(suggestions.docs.len(), 2);
        assert_eq!(suggestions.docs[0].suggest, "<b>Fre</b>sh Farms");
        assert_eq!(
            suggestions.docs[0].payload.as_deref(),
            Some("https://cdn/store.png | Fresh Farms")
        );
        assert_eq!(suggestions.docs[1].suggest, "Fruit Hub");
        assert_eq!(suggestions.docs[1].payload, None);

        let empty = Suggestions::from_response(SuggestField::ItemName, &serde_json::json!({}));
        assert_eq!(empty, Suggestions::default());
    }

    #[test]
    fn escapes_query_syntax() {
        assert_eq!(escape_term("Fresh & Co: (BLR)"), r"Fresh\ \&\ Co\:\ \(BLR\)");
    }
}
