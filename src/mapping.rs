//! Source-specific request shapes and record mapping.
//!
//! Every [`SourceKind`] fixes three things at compile time:
//!
//! | Concern | Function |
//! |---------|----------|
//! | How to ask for one page | [`endpoint`], [`query_params`], [`request_body`] |
//! | Where the records and the next cursor live in the response | [`extract_page`] |
//! | How one raw record becomes a [`CanonicalRecord`] | [`map_record`] |
//!
//! Mapping is pure: the same raw payload always yields the same natural key
//! and field map. `last_seen` is left at the Unix epoch; the upsert sink
//! stamps it at write time.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};

use crate::error::{FetchError, MapError};
use crate::models::{CanonicalRecord, Cursor, NaturalKey, RawRecord, SourceKind, TimePeriod};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// How a source pages through its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paging {
    /// 1-based page number; more pages while the flag at `has_next` is true.
    PageFlag { has_next: &'static str },
    /// 1-based page number bounded by the count at `total`.
    PageTotal { total: &'static str },
    /// 0-based record offset bounded by the count at `total`.
    Offset { total: &'static str },
    /// Absolute URL of the next page at `next`, null on the last page.
    NextUrl { next: &'static str },
}

/// Static request shape of one source kind.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub method: HttpMethod,
    pub path: &'static str,
    /// JSON pointer to the records array in a response.
    pub records: &'static str,
    pub paging: Paging,
    /// Query parameter carrying the API key, when the source takes one.
    pub credential_param: Option<&'static str>,
}

pub fn endpoint(kind: SourceKind) -> Endpoint {
    match kind {
        SourceKind::UsaspendingAwards | SourceKind::UsaspendingGrants => Endpoint {
            method: HttpMethod::Post,
            path: "/api/v2/search/spending_by_award/",
            records: "/results",
            paging: Paging::PageFlag {
                has_next: "/page_metadata/hasNext",
            },
            credential_param: None,
        },
        SourceKind::GrantsGov => Endpoint {
            method: HttpMethod::Post,
            path: "/v1/api/search2",
            records: "/data/oppHits",
            paging: Paging::Offset {
                total: "/data/hitCount",
            },
            credential_param: None,
        },
        SourceKind::SamOpportunities => Endpoint {
            method: HttpMethod::Get,
            path: "/opportunities/v2/search",
            records: "/opportunitiesData",
            paging: Paging::Offset {
                total: "/totalRecords",
            },
            credential_param: Some("api_key"),
        },
        SourceKind::SamEntities => Endpoint {
            method: HttpMethod::Get,
            path: "/entity-information/v3/entities",
            records: "/entityData",
            paging: Paging::PageTotal {
                total: "/totalRecords",
            },
            credential_param: Some("api_key"),
        },
        SourceKind::SamExclusions => Endpoint {
            method: HttpMethod::Get,
            path: "/entity-information/v4/exclusions",
            records: "/excludedEntity",
            paging: Paging::PageTotal {
                total: "/totalRecords",
            },
            credential_param: Some("api_key"),
        },
        SourceKind::FederalRegister => Endpoint {
            method: HttpMethod::Get,
            path: "/documents.json",
            records: "/results",
            paging: Paging::NextUrl {
                next: "/next_page_url",
            },
            credential_param: None,
        },
        SourceKind::StateContracts => Endpoint {
            method: HttpMethod::Get,
            path: "/contracts",
            records: "/records",
            paging: Paging::PageFlag {
                has_next: "/has_more",
            },
            credential_param: Some("api_key"),
        },
    }
}

/// Numeric position a cursor stands for: page number or record offset.
pub fn position(paging: Paging, cursor: &Cursor) -> u64 {
    let start = match paging {
        Paging::Offset { .. } => 0,
        _ => 1,
    };
    match cursor {
        Cursor::Start => start,
        Cursor::Page(p) => p.parse().unwrap_or(start),
    }
}

fn partition_value(partition: &str) -> Option<&str> {
    (partition != "*").then_some(partition)
}

/// Query string for GET sources.
pub fn query_params(
    kind: SourceKind,
    partition: &str,
    position: u64,
    page_size: u32,
) -> Vec<(String, String)> {
    let mut params: Vec<(&str, String)> = Vec::new();
    match kind {
        SourceKind::SamOpportunities => {
            params.push(("limit", page_size.to_string()));
            params.push(("offset", position.to_string()));
            if let Some(state) = partition_value(partition) {
                params.push(("state", state.to_string()));
            }
        }
        SourceKind::SamEntities => {
            params.push(("size", page_size.to_string()));
            params.push(("page", position.to_string()));
            if let Some(state) = partition_value(partition) {
                params.push(("physicalAddressProvinceOrStateCode", state.to_string()));
            }
        }
        SourceKind::SamExclusions => {
            params.push(("size", page_size.to_string()));
            params.push(("page", position.to_string()));
            if let Some(state) = partition_value(partition) {
                params.push(("stateProvince", state.to_string()));
            }
        }
        SourceKind::FederalRegister => {
            params.push(("per_page", page_size.to_string()));
            params.push(("page", position.to_string()));
            params.push(("order", "newest".to_string()));
            if let Some(agency) = partition_value(partition) {
                params.push(("conditions[agencies][]", agency.to_string()));
            }
        }
        SourceKind::StateContracts => {
            params.push(("per_page", page_size.to_string()));
            params.push(("page", position.to_string()));
            if let Some(state) = partition_value(partition) {
                params.push(("state", state.to_string()));
            }
        }
        SourceKind::UsaspendingAwards | SourceKind::UsaspendingGrants | SourceKind::GrantsGov => {}
    }
    params
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

const AWARD_FIELDS: [&str; 10] = [
    "Award ID",
    "generated_internal_id",
    "Recipient Name",
    "Recipient UEI",
    "Award Amount",
    "Awarding Agency",
    "Start Date",
    "Last Modified Date",
    "Place of Performance State Code",
    "Description",
];

/// JSON body for POST sources, `None` for GET sources.
pub fn request_body(
    kind: SourceKind,
    partition: &str,
    position: u64,
    page_size: u32,
    period: Option<&TimePeriod>,
) -> Option<Value> {
    match kind {
        SourceKind::UsaspendingAwards | SourceKind::UsaspendingGrants => {
            let codes: &[&str] = if kind == SourceKind::UsaspendingAwards {
                &["A", "B", "C", "D"]
            } else {
                &["02", "03", "04", "05"]
            };
            let mut filters = json!({ "award_type_codes": codes });
            if let Some(state) = partition_value(partition) {
                filters["place_of_performance_locations"] =
                    json!([{ "country": "USA", "state": state }]);
            }
            if let Some(period) = period {
                filters["time_period"] = json!([{
                    "start_date": period.start_date.format("%Y-%m-%d").to_string(),
                    "end_date": period.end_date.format("%Y-%m-%d").to_string(),
                }]);
            }
            Some(json!({
                "filters": filters,
                "fields": AWARD_FIELDS,
                "page": position,
                "limit": page_size,
                "sort": "Award Amount",
                "order": "desc",
            }))
        }
        SourceKind::GrantsGov => {
            let mut body = json!({
                "rows": page_size,
                "startRecordNum": position,
                "oppStatuses": "forecasted|posted",
            });
            if let Some(keyword) = partition_value(partition) {
                body["keyword"] = json!(keyword);
            }
            Some(body)
        }
        _ => None,
    }
}

/// Split a response body into its records and the cursor of the next page.
pub fn extract_page(
    kind: SourceKind,
    body: &Value,
    position: u64,
    page_size: u32,
) -> Result<(Vec<RawRecord>, Option<Cursor>), FetchError> {
    let ep = endpoint(kind);
    let records: Vec<RawRecord> = match body.pointer(ep.records) {
        Some(Value::Array(items)) => items.iter().cloned().map(RawRecord).collect(),
        // An empty result set is sometimes sent as null.
        Some(Value::Null) => Vec::new(),
        Some(_) => {
            return Err(FetchError::Malformed(format!(
                "{} is not an array",
                ep.records
            )))
        }
        None => {
            return Err(FetchError::Malformed(format!(
                "response has no {}",
                ep.records
            )))
        }
    };

    if records.is_empty() {
        return Ok((records, None));
    }

    let next = match ep.paging {
        Paging::PageFlag { has_next } => body
            .pointer(has_next)
            .and_then(Value::as_bool)
            .unwrap_or(false)
            .then(|| Cursor::Page((position + 1).to_string())),
        Paging::PageTotal { total } => {
            let total = body.pointer(total).and_then(as_u64).unwrap_or(0);
            (position * u64::from(page_size) < total)
                .then(|| Cursor::Page((position + 1).to_string()))
        }
        Paging::Offset { total } => {
            let total = body.pointer(total).and_then(as_u64).unwrap_or(0);
            let next = position + records.len() as u64;
            (next < total).then(|| Cursor::Page(next.to_string()))
        }
        Paging::NextUrl { next } => body
            .pointer(next)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| Cursor::Page(s.to_string())),
    };

    Ok((records, next))
}

fn as_u64(v: &Value) -> Option<u64> {
    v.as_u64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

// ── Normalizers ─────────────────────────────────────────────────────────

/// Non-blank trimmed string at `pointer`. Numbers are rendered as strings.
fn text(raw: &Value, pointer: &str) -> Option<String> {
    match raw.pointer(pointer)? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_text(raw: &Value, pointers: &[&str]) -> Option<String> {
    pointers.iter().find_map(|p| text(raw, p))
}

fn required(raw: &Value, field: &str, pointers: &[&str]) -> Result<String, MapError> {
    first_text(raw, pointers).ok_or_else(|| MapError::missing(field))
}

/// Monetary amount as `f64`. Accepts numbers and strings like `"$1,250.00"`.
pub fn amount(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' '))
                .collect();
            cleaned.parse().ok()
        }
        _ => None,
    }
}

/// Parse the date formats seen upstream into a UTC instant.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y", "%b %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| Utc.from_utc_datetime(&n));
        }
    }
    None
}

/// Normalize any recognized date to `YYYY-MM-DD`.
pub fn normalize_date(s: &str) -> Option<String> {
    parse_timestamp(s).map(|t| t.format("%Y-%m-%d").to_string())
}

fn date(raw: &Value, pointers: &[&str]) -> Value {
    first_text(raw, pointers)
        .and_then(|s| normalize_date(&s))
        .map(Value::String)
        .unwrap_or(Value::Null)
}

fn opt(v: Option<String>) -> Value {
    v.map(Value::String).unwrap_or(Value::Null)
}

fn build(
    kind: SourceKind,
    key: Vec<String>,
    key_field: &str,
    fields: Map<String, Value>,
    updated: Option<String>,
) -> Result<CanonicalRecord, MapError> {
    let key = NaturalKey::new(key).ok_or_else(|| MapError::missing(key_field))?;
    Ok(CanonicalRecord {
        kind: kind.entity_kind(),
        key,
        fields,
        source: String::new(),
        source_updated_at: updated.as_deref().and_then(parse_timestamp),
        last_seen: DateTime::<Utc>::UNIX_EPOCH,
    })
}

fn object(fields: Value) -> Map<String, Value> {
    match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Map one raw record. `source` is left empty; the connector fills in its id.
pub fn map_record(kind: SourceKind, raw: &RawRecord) -> Result<CanonicalRecord, MapError> {
    let raw = &raw.0;
    if !raw.is_object() {
        return Err(MapError::NotAnObject);
    }

    match kind {
        SourceKind::UsaspendingAwards | SourceKind::UsaspendingGrants => {
            let award_id = required(raw, "award_id", &["/generated_internal_id", "/Award ID"])?;
            let fields = object(json!({
                "award_id": award_id,
                "display_id": opt(text(raw, "/Award ID")),
                "recipient_uei": opt(text(raw, "/Recipient UEI")),
                "recipient_name": opt(text(raw, "/Recipient Name")),
                "agency": opt(text(raw, "/Awarding Agency")),
                "amount": amount(raw.get("Award Amount")),
                "action_date": date(raw, &["/Start Date"]),
                "state": opt(text(raw, "/Place of Performance State Code")),
                "description": opt(text(raw, "/Description")),
            }));
            build(
                kind,
                vec![award_id],
                "award_id",
                fields,
                text(raw, "/Last Modified Date"),
            )
        }
        SourceKind::GrantsGov => {
            let id = required(raw, "opportunity_id", &["/id"])?;
            let fields = object(json!({
                "opportunity_id": id,
                "number": opt(text(raw, "/number")),
                "title": opt(text(raw, "/title")),
                "agency": opt(first_text(raw, &["/agency", "/agencyName", "/agencyCode"])),
                "posted_date": date(raw, &["/openDate"]),
                "response_deadline": date(raw, &["/closeDate"]),
                "status": opt(text(raw, "/oppStatus")),
            }));
            build(kind, vec![id], "opportunity_id", fields, None)
        }
        SourceKind::SamOpportunities => {
            let id = required(raw, "notice_id", &["/noticeId"])?;
            let fields = object(json!({
                "notice_id": id,
                "title": opt(text(raw, "/title")),
                "agency": opt(first_text(raw, &["/fullParentPathName", "/department"])),
                "posted_date": date(raw, &["/postedDate"]),
                "response_deadline": date(raw, &["/responseDeadLine"]),
                "naics": opt(text(raw, "/naicsCode")),
                "notice_type": opt(text(raw, "/type")),
                "url": opt(text(raw, "/uiLink")),
            }));
            build(kind, vec![id], "notice_id", fields, None)
        }
        SourceKind::SamEntities => {
            let uei = required(raw, "uei", &["/entityRegistration/ueiSAM", "/ueiSAM"])?;
            let fields = object(json!({
                "uei": uei,
                "legal_name": opt(first_text(raw, &[
                    "/entityRegistration/legalBusinessName",
                    "/legalBusinessName",
                ])),
                "cage_code": opt(text(raw, "/entityRegistration/cageCode")),
                "state": opt(text(raw, "/coreData/physicalAddress/stateOrProvinceCode")),
                "naics": opt(text(raw, "/assertions/goodsAndServices/primaryNaics")),
                "registration_status": opt(text(raw, "/entityRegistration/registrationStatus")),
            }));
            build(
                kind,
                vec![uei],
                "uei",
                fields,
                text(raw, "/entityRegistration/lastUpdateDate"),
            )
        }
        SourceKind::SamExclusions => {
            let uei = text(raw, "/exclusionIdentification/ueiSAM");
            let name = first_text(
                raw,
                &["/exclusionIdentification/entityName", "/exclusionIdentification/name"],
            );
            let subject = uei
                .clone()
                .or_else(|| name.clone())
                .ok_or_else(|| MapError::missing("uei"))?;
            let exclusion_type =
                required(raw, "exclusion_type", &["/exclusionDetails/exclusionType"])?;
            let activation = first_text(raw, &["/exclusionActions/listOfActions/0/activateDate"])
                .and_then(|s| normalize_date(&s))
                .ok_or_else(|| MapError::missing("activation_date"))?;
            let fields = object(json!({
                "uei": opt(uei),
                "name": opt(name),
                "exclusion_type": exclusion_type,
                "activation_date": activation,
                "agency": opt(text(raw, "/exclusionDetails/excludingAgencyName")),
            }));
            build(
                kind,
                vec![subject, exclusion_type, activation],
                "uei",
                fields,
                None,
            )
        }
        SourceKind::FederalRegister => {
            let number = required(raw, "document_number", &["/document_number"])?;
            let fields = object(json!({
                "document_number": number,
                "title": opt(text(raw, "/title")),
                "agency": opt(first_text(raw, &["/agencies/0/name", "/agency_names/0"])),
                "publication_date": date(raw, &["/publication_date"]),
                "document_type": opt(text(raw, "/type")),
                "url": opt(text(raw, "/html_url")),
            }));
            build(kind, vec![number], "document_number", fields, None)
        }
        SourceKind::StateContracts => {
            let state = required(raw, "state", &["/state"])?.to_uppercase();
            let contract_id = required(raw, "contract_id", &["/contract_id"])?;
            let fields = object(json!({
                "state": state,
                "contract_id": contract_id,
                "recipient_uei": opt(text(raw, "/vendor_uei")),
                "recipient_name": opt(text(raw, "/vendor_name")),
                "agency": opt(text(raw, "/agency")),
                "amount": amount(raw.get("amount")),
                "action_date": date(raw, &["/award_date"]),
            }));
            build(
                kind,
                vec![state, contract_id],
                "contract_id",
                fields,
                text(raw, "/updated_at"),
            )
        }
    }
}
