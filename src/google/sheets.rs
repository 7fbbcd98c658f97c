//! Appending upload results to a Google spreadsheet.
//!
//! The append is four sequential remote calls at most: ensure the sheet
//! tab exists, ensure row 1 holds the header (frozen), append the data
//! row. The calls are not transactional; a failure partway leaves whatever
//! already succeeded in place.

use serde_json::{json, Value};
use tracing::{debug, info};

use super::{check_status, ApiError};
use crate::google::auth::AuthClient;

const SHEETS_ENDPOINT: &str = "https://sheets.googleapis.com/v4/spreadsheets";

#[derive(Debug, thiserror::Error)]
pub enum SheetError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("unexpected sheets response: {reason}")]
    MalformedResponse { reason: String },
}

/// The remote operations one append may need, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetStep {
    AddSheet,
    WriteHeader,
    FreezeHeader,
    AppendRow,
}

/// Decide which calls this append needs from the observed remote state.
pub fn plan_steps(sheet_exists: bool, has_header: bool) -> Vec<SheetStep> {
    let mut steps = Vec::new();
    if !sheet_exists {
        steps.push(SheetStep::AddSheet);
    }
    if !has_header {
        steps.push(SheetStep::WriteHeader);
        steps.push(SheetStep::FreezeHeader);
    }
    steps.push(SheetStep::AppendRow);
    steps
}

/// Append one row, creating the sheet tab and header on first use.
pub async fn append_row(
    auth: &AuthClient,
    sheet_id: &str,
    sheet_title: &str,
    header: &[&str],
    row: &[String],
) -> Result<(), SheetError> {
    let mut tab_id = fetch_tab_id(auth, sheet_id, sheet_title).await?;
    let has_header = if tab_id.is_some() {
        fetch_has_header(auth, sheet_id, sheet_title).await?
    } else {
        false
    };

    let steps = plan_steps(tab_id.is_some(), has_header);
    debug!(?steps, sheet_title, "sheet append plan");

    for step in steps {
        match step {
            SheetStep::AddSheet => {
                tab_id = Some(add_sheet(auth, sheet_id, sheet_title).await?);
            }
            SheetStep::WriteHeader => {
                write_header(auth, sheet_id, sheet_title, header).await?;
            }
            SheetStep::FreezeHeader => {
                let tab_id = tab_id.ok_or_else(|| SheetError::MalformedResponse {
                    reason: "no sheet id available for freeze".into(),
                })?;
                freeze_header(auth, sheet_id, tab_id).await?;
            }
            SheetStep::AppendRow => {
                append_values(auth, sheet_id, sheet_title, row).await?;
            }
        }
    }

    info!(sheet_title, "row appended to spreadsheet");
    Ok(())
}

/// Numeric tab id for `title`, if the tab exists.
async fn fetch_tab_id(
    auth: &AuthClient,
    sheet_id: &str,
    title: &str,
) -> Result<Option<i64>, SheetError> {
    let url = format!("{SHEETS_ENDPOINT}/{sheet_id}?fields=sheets.properties");
    let resp = auth
        .http()
        .get(&url)
        .header("Authorization", auth.bearer())
        .send()
        .await
        .map_err(ApiError::from)?;
    let resp = check_status(resp).await?;
    let body: Value = resp.json().await.map_err(ApiError::from)?;

    Ok(find_tab_id(&body, title))
}

/// Scan a spreadsheet-get response for a tab with the given title.
pub(crate) fn find_tab_id(body: &Value, title: &str) -> Option<i64> {
    body.get("sheets")?
        .as_array()?
        .iter()
        .filter_map(|sheet| sheet.get("properties"))
        .find(|props| props.get("title").and_then(Value::as_str) == Some(title))
        .and_then(|props| props.get("sheetId"))
        .and_then(Value::as_i64)
}

async fn fetch_has_header(
    auth: &AuthClient,
    sheet_id: &str,
    title: &str,
) -> Result<bool, SheetError> {
    let url = values_url(sheet_id, &format!("{title}!1:1"));
    let resp = auth
        .http()
        .get(&url)
        .header("Authorization", auth.bearer())
        .send()
        .await
        .map_err(ApiError::from)?;
    let resp = check_status(resp).await?;
    let body: Value = resp.json().await.map_err(ApiError::from)?;

    let has_header = body
        .get("values")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_array)
        .map(|row| !row.is_empty())
        .unwrap_or(false);
    Ok(has_header)
}

async fn add_sheet(auth: &AuthClient, sheet_id: &str, title: &str) -> Result<i64, SheetError> {
    let url = format!("{SHEETS_ENDPOINT}/{sheet_id}:batchUpdate");
    let body = json!({
        "requests": [
            { "addSheet": { "properties": { "title": title } } }
        ]
    });

    let resp = auth
        .http()
        .post(&url)
        .header("Authorization", auth.bearer())
        .json(&body)
        .send()
        .await
        .map_err(ApiError::from)?;
    let resp = check_status(resp).await?;
    let reply: Value = resp.json().await.map_err(ApiError::from)?;

    reply
        .pointer("/replies/0/addSheet/properties/sheetId")
        .and_then(Value::as_i64)
        .ok_or_else(|| SheetError::MalformedResponse {
            reason: format!("addSheet reply carried no sheetId: {reply}"),
        })
}

async fn write_header(
    auth: &AuthClient,
    sheet_id: &str,
    title: &str,
    header: &[&str],
) -> Result<(), SheetError> {
    let url = format!(
        "{}?valueInputOption=RAW",
        values_url(sheet_id, &format!("{title}!A1"))
    );
    let body = json!({ "values": [header] });

    let resp = auth
        .http()
        .put(&url)
        .header("Authorization", auth.bearer())
        .json(&body)
        .send()
        .await
        .map_err(ApiError::from)?;
    check_status(resp).await?;
    Ok(())
}

async fn freeze_header(auth: &AuthClient, sheet_id: &str, tab_id: i64) -> Result<(), SheetError> {
    let url = format!("{SHEETS_ENDPOINT}/{sheet_id}:batchUpdate");
    let body = json!({
        "requests": [
            {
                "updateSheetProperties": {
                    "fields": "gridProperties.frozenRowCount",
                    "properties": {
                        "sheetId": tab_id,
                        "gridProperties": { "frozenRowCount": 1 }
                    }
                }
            }
        ]
    });

    let resp = auth
        .http()
        .post(&url)
        .header("Authorization", auth.bearer())
        .json(&body)
        .send()
        .await
        .map_err(ApiError::from)?;
    check_status(resp).await?;
    Ok(())
}

async fn append_values(
    auth: &AuthClient,
    sheet_id: &str,
    title: &str,
    row: &[String],
) -> Result<(), SheetError> {
    let url = format!(
        "{}:append?valueInputOption=RAW",
        values_url(sheet_id, &format!("{title}!A:Z"))
    );
    let body = json!({ "values": [row] });

    let resp = auth
        .http()
        .post(&url)
        .header("Authorization", auth.bearer())
        .json(&body)
        .send()
        .await
        .map_err(ApiError::from)?;
    check_status(resp).await?;
    Ok(())
}

fn values_url(sheet_id: &str, range: &str) -> String {
    format!("{SHEETS_ENDPOINT}/{sheet_id}/values/{}", encode_range(range))
}

/// Percent-encode a range for use as a URL path segment. `!` and `:` are
/// legal in path segments and stay readable.
fn encode_range(range: &str) -> String {
    let mut out = String::with_capacity(range.len());
    for byte in range.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'!'
            | b':' | b'(' | b')' | b'\'' | b'*' | b'@' | b',' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sheet_plans_full_sequence() {
        assert_eq!(
            plan_steps(false, false),
            vec![
                SheetStep::AddSheet,
                SheetStep::WriteHeader,
                SheetStep::FreezeHeader,
                SheetStep::AppendRow,
            ]
        );
    }

    #[test]
    fn existing_sheet_without_header_skips_creation() {
        assert_eq!(
            plan_steps(true, false),
            vec![
                SheetStep::WriteHeader,
                SheetStep::FreezeHeader,
                SheetStep::AppendRow,
            ]
        );
    }

    #[test]
    fn fully_initialized_sheet_only_appends() {
        assert_eq!(plan_steps(true, true), vec![SheetStep::AppendRow]);
    }

    #[test]
    fn tab_id_found_by_title() {
        let body = json!({
            "sheets": [
                { "properties": { "title": "Sheet1", "sheetId": 0 } },
                { "properties": { "title": "Uploads", "sheetId": 123456 } },
            ]
        });
        assert_eq!(find_tab_id(&body, "Uploads"), Some(123456));
        assert_eq!(find_tab_id(&body, "Sheet1"), Some(0));
        assert_eq!(find_tab_id(&body, "Missing"), None);
        assert_eq!(find_tab_id(&json!({}), "Uploads"), None);
    }

    #[test]
    fn range_is_percent_encoded_into_values_url() {
        let url = values_url("sheet-id", "My Tab!A:Z");
        assert_eq!(
            url,
            "https://sheets.googleapis.com/v4/spreadsheets/sheet-id/values/My%20Tab!A:Z"
        );
        assert_eq!(encode_range("Uploads!1:1"), "Uploads!1:1");
        assert_eq!(encode_range("50%/done"), "50%25%2Fdone");
    }
}
