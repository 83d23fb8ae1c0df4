//! ENERGY STAR Portfolio Manager client: property listing, the asynchronous
//! report workflow, and extraction of tag-based metrics into storage rows.

use std::time::Duration;

use ebm_core::{GapStatus, PropertyYearRecord};
use ebm_storage::{retry_async, BackoffPolicy, RetryDisposition};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "ebm-espm";

pub const DEFAULT_BASE_URL: &str = "https://portfoliomanager.energystar.gov/ws";

#[derive(Debug, Error)]
pub enum EspmError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("malformed xml: {0}")]
    Xml(String),
    #[error("report contained no property metrics")]
    EmptyReport,
    #[error("no properties left to request after applying the exclude list")]
    NoPropertiesRequested,
    #[error("report not ready after {waited_secs}s")]
    ReportNotReady { waited_secs: u64 },
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

fn classify_espm_error(err: &EspmError) -> RetryDisposition {
    match err {
        EspmError::Http(inner) => classify_reqwest_error(inner),
        EspmError::Status { status, .. } => match StatusCode::from_u16(*status) {
            Ok(status) => classify_status(status),
            Err(_) => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

#[derive(Debug, Clone)]
pub struct EspmCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct EspmClientConfig {
    pub base_url: String,
    pub account_id: u64,
    pub report_id: u64,
    /// Per-call HTTP timeout.
    pub timeout: Duration,
    /// Delay between download attempts while the report is generating.
    pub poll_interval: Duration,
    /// Ceiling on the total time spent waiting for generation.
    pub max_wait: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for EspmClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            account_id: 0,
            report_id: 0,
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(15),
            max_wait: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A reporting window: January of `from_year` through December of `to_year`,
/// yearly granularity.
#[derive(Debug, Clone, Copy)]
pub struct ReportWindow {
    pub from_year: i32,
    pub to_year: i32,
}

/// Render the report specification XML. The exclude list is applied BEFORE
/// the id list is built: some ids appear in the account listing without
/// being shared with this account, and a single such id fails the request
/// for the whole batch.
pub fn build_report_specification(
    property_ids: &[i64],
    window: ReportWindow,
    exclude: &[i64],
) -> Result<String, EspmError> {
    let ids: Vec<i64> = property_ids
        .iter()
        .copied()
        .filter(|id| !exclude.contains(id))
        .collect();
    if ids.is_empty() {
        return Err(EspmError::NoPropertiesRequested);
    }
    let ids_xml = ids
        .iter()
        .map(|id| format!("          <id>{id}</id>"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<report>
     <timeframe>
          <dateRange>
               <fromPeriodEndingDate>
                    <month>1</month>
                    <year>{from_year}</year>
               </fromPeriodEndingDate>
               <toPeriodEndingDate>
                     <month>12</month>
                    <year>{to_year}</year>
               </toPeriodEndingDate>
                <interval>YEARLY</interval>
          </dateRange>
     </timeframe>
     <properties>
{ids_xml}
     </properties>
</report>"#,
        from_year = window.from_year,
        to_year = window.to_year,
    ))
}

/// One `propertyMetrics` group: everything the report says about a single
/// (property, year) pair.
#[derive(Debug, Clone)]
pub struct PropertyMetricsGroup {
    pub property_id: String,
    pub year: Option<String>,
    pub metrics: Vec<RawMetric>,
}

/// A (metric name, value) pair straight off the wire. `value` is `None` when
/// the element was empty or carried nested structure instead of text.
#[derive(Debug, Clone)]
pub struct RawMetric {
    pub name: String,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawReport {
    pub groups: Vec<PropertyMetricsGroup>,
}

#[derive(Debug, Clone)]
pub struct ReportDownload {
    /// Exact bytes as downloaded, for archiving.
    pub body: Vec<u8>,
    pub report: RawReport,
}

fn attr_value(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, EspmError> {
    match element.try_get_attribute(name) {
        Ok(Some(attr)) => Ok(Some(
            attr.unescape_value()
                .map_err(|err| EspmError::Xml(err.to_string()))?
                .into_owned(),
        )),
        Ok(None) => Ok(None),
        Err(err) => Err(EspmError::Xml(err.to_string())),
    }
}

/// Parse a rendered report. The shape is
/// `reportData/informationAndMetrics/propertyMetrics[@propertyId,@year]/metric[@name]/value`.
pub fn parse_report(xml: &[u8]) -> Result<RawReport, EspmError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut groups: Vec<PropertyMetricsGroup> = Vec::new();
    let mut group: Option<PropertyMetricsGroup> = None;
    let mut metric: Option<RawMetric> = None;
    let mut in_value = false;
    let mut value_is_structured = false;
    let mut value_text: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                _ if in_value => {
                    // A <value> holding child elements is the feed's typed
                    // empty container; it normalises to "missing".
                    value_is_structured = true;
                }
                b"propertyMetrics" => {
                    group = Some(PropertyMetricsGroup {
                        property_id: attr_value(e, "propertyId")?.unwrap_or_default(),
                        year: attr_value(e, "year")?,
                        metrics: Vec::new(),
                    });
                }
                b"metric" if group.is_some() => {
                    metric = Some(RawMetric {
                        name: attr_value(e, "name")?.unwrap_or_default(),
                        value: None,
                    });
                }
                b"value" if metric.is_some() => {
                    in_value = true;
                    value_is_structured = false;
                    value_text = None;
                }
                _ => {}
            },
            Ok(Event::Empty(ref e)) => match e.local_name().as_ref() {
                _ if in_value => {
                    value_is_structured = true;
                }
                b"propertyMetrics" => {
                    groups.push(PropertyMetricsGroup {
                        property_id: attr_value(e, "propertyId")?.unwrap_or_default(),
                        year: attr_value(e, "year")?,
                        metrics: Vec::new(),
                    });
                }
                b"metric" => {
                    if let Some(group) = group.as_mut() {
                        group.metrics.push(RawMetric {
                            name: attr_value(e, "name")?.unwrap_or_default(),
                            value: None,
                        });
                    }
                }
                // <value/> (often xsi:nil) stays missing.
                _ => {}
            },
            Ok(Event::Text(ref t)) => {
                if in_value && !value_is_structured {
                    let text = t
                        .unescape()
                        .map_err(|err| EspmError::Xml(err.to_string()))?
                        .into_owned();
                    if !text.is_empty() {
                        value_text = Some(text);
                    }
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"value" => {
                    if let Some(metric) = metric.as_mut() {
                        metric.value = if value_is_structured {
                            None
                        } else {
                            value_text.take()
                        };
                    }
                    in_value = false;
                    value_is_structured = false;
                    value_text = None;
                }
                b"metric" => {
                    if let (Some(group), Some(metric)) = (group.as_mut(), metric.take()) {
                        group.metrics.push(metric);
                    }
                }
                b"propertyMetrics" => {
                    if let Some(group) = group.take() {
                        groups.push(group);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(err) => return Err(EspmError::Xml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }

    Ok(RawReport { groups })
}

/// Parse the account property listing: `response/links/link[@id]`.
pub fn parse_property_list(xml: &[u8]) -> Result<Vec<i64>, EspmError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut ids = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"link" {
                    if let Some(raw) = attr_value(e, "id")? {
                        match raw.trim().parse::<i64>() {
                            Ok(id) => ids.push(id),
                            Err(_) => warn!(id = %raw, "skipping unparseable property id"),
                        }
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(EspmError::Xml(err.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(ids)
}

/// Fixed metric-name → field mapping. Unmapped names are ignored; missing
/// metrics leave the field null.
pub fn extract(report: &RawReport) -> Vec<PropertyYearRecord> {
    let mut records = Vec::with_capacity(report.groups.len());
    for group in &report.groups {
        let Ok(property_id) = group.property_id.trim().parse::<i64>() else {
            warn!(property_id = %group.property_id, "skipping group with unparseable property id");
            continue;
        };
        let year = group
            .year
            .as_deref()
            .map(str::trim)
            .filter(|y| !y.is_empty());
        let Some(year) = year else {
            warn!(property_id, "skipping group without a reporting year");
            continue;
        };

        let mut record = PropertyYearRecord::new(property_id, year);
        for metric in &group.metrics {
            let value = metric.value.as_deref();
            let owned = || value.map(str::to_string);
            match metric.name.as_str() {
                "propertyName" => record.building_name = owned(),
                "propGrossFloorArea" => record.floor_area = owned(),
                "address1" => record.address = owned(),
                "occupancy" => record.occupancy = owned(),
                "numberOfBuildings" => record.building_count = owned(),
                "primaryPropertyTypeSelfSelected" => record.use_type = owned(),
                "yearBuilt" => record.year_built = owned(),
                "siteIntensity" => record.site_eui = owned(),
                "waterIntensityTotal" => record.water_intensity = owned(),
                "alertEnergyMeterGap" => record.energy_gap = GapStatus::from_raw(value),
                "alertWaterMeterGap" => record.water_gap = GapStatus::from_raw(value),
                "alertEnergyMeterLessThanTwelveMonthsMeterData" => {
                    record.energy_months_short = GapStatus::from_raw(value)
                }
                "alertWaterMeterLessThanTwelveMonthsMeterData" => {
                    record.water_months_short = GapStatus::from_raw(value)
                }
                "parentPropertyId" => {
                    record.parent_property_id = value.and_then(|v| v.trim().parse::<i64>().ok())
                }
                _ => {}
            }
        }
        records.push(record);
    }
    records
}

pub struct EspmClient {
    http: reqwest::Client,
    credentials: EspmCredentials,
    config: EspmClientConfig,
}

impl EspmClient {
    pub fn new(credentials: EspmCredentials, config: EspmClientConfig) -> Result<Self, EspmError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            credentials,
            config,
        })
    }

    /// One HTTP call with Basic credentials, retried on timeouts and 5xx/429
    /// under the shared backoff policy.
    async fn call(
        &self,
        method: Method,
        url: String,
        body: Option<String>,
    ) -> Result<Vec<u8>, EspmError> {
        let http = self.http.clone();
        let username = self.credentials.username.clone();
        let password = self.credentials.password.clone();
        retry_async(&self.config.backoff, classify_espm_error, move |attempt| {
            let http = http.clone();
            let method = method.clone();
            let url = url.clone();
            let body = body.clone();
            let username = username.clone();
            let password = password.clone();
            async move {
                if attempt > 0 {
                    debug!(attempt, %url, "retrying espm call");
                }
                let mut request = http
                    .request(method, url.as_str())
                    .basic_auth(&username, Some(&password));
                if let Some(body) = body {
                    request = request
                        .header(reqwest::header::CONTENT_TYPE, "application/xml")
                        .body(body);
                }
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(EspmError::Status {
                        status: status.as_u16(),
                        url: response.url().to_string(),
                    });
                }
                Ok(response.bytes().await?.to_vec())
            }
        })
        .await
    }

    /// All property ids under the account, including ids the account cannot
    /// actually read; callers apply the exclude list before requesting.
    pub async fn list_property_ids(&self) -> Result<Vec<i64>, EspmError> {
        let url = format!(
            "{}/account/{}/property/list",
            self.config.base_url, self.config.account_id
        );
        let body = self.call(Method::GET, url, None).await?;
        parse_property_list(&body)
    }

    /// Drive the asynchronous report workflow: PUT the specification, POST
    /// to trigger generation, then poll the download until it parses into a
    /// non-empty report or the wait ceiling is hit. ESPM exposes no
    /// confirmed status endpoint, so the download itself is the status
    /// check.
    pub async fn request_report(
        &self,
        property_ids: &[i64],
        window: ReportWindow,
        exclude: &[i64],
    ) -> Result<ReportDownload, EspmError> {
        let specification = build_report_specification(property_ids, window, exclude)?;
        let report_url = format!("{}/reports/{}", self.config.base_url, self.config.report_id);

        self.call(Method::PUT, report_url.clone(), Some(specification))
            .await?;
        self.call(Method::POST, format!("{report_url}/generate"), None)
            .await?;

        let download_url = format!("{report_url}/download?type=XML");
        let mut waited = Duration::ZERO;
        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            waited += self.config.poll_interval;

            match self.try_download(&download_url).await {
                Ok(download) => return Ok(download),
                Err(err) if waited < self.config.max_wait => {
                    debug!(error = %err, waited_secs = waited.as_secs(), "report not ready; polling again");
                }
                Err(err) => {
                    warn!(error = %err, waited_secs = waited.as_secs(), "report never became ready");
                    return Err(EspmError::ReportNotReady {
                        waited_secs: waited.as_secs(),
                    });
                }
            }
        }
    }

    async fn try_download(&self, download_url: &str) -> Result<ReportDownload, EspmError> {
        let body = self
            .call(Method::GET, download_url.to_string(), None)
            .await?;
        let report = parse_report(&body)?;
        if report.groups.is_empty() {
            return Err(EspmError::EmptyReport);
        }
        Ok(ReportDownload { body, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<reportData>
  <informationAndMetrics>
    <propertyMetrics propertyId="200" year="2023">
      <metric name="propertyName"><value>Larcom City Hall</value></metric>
      <metric name="propGrossFloorArea"><value>105000</value></metric>
      <metric name="siteIntensity"><value>88.4</value></metric>
      <metric name="alertEnergyMeterGap"><value>OK</value></metric>
      <metric name="alertWaterMeterGap"><value>Possible Issue</value></metric>
      <metric name="parentPropertyId"><value>200</value></metric>
      <metric name="unknownMetricName"><value>ignored</value></metric>
    </propertyMetrics>
    <propertyMetrics propertyId="200" year="2024">
      <metric name="propertyName"><value>Larcom City Hall</value></metric>
      <metric name="waterIntensityTotal"><value/></metric>
      <metric name="alertWaterMeterLessThanTwelveMonthsMeterData">
        <value><empty xsi:nil="true"/></value>
      </metric>
      <metric name="parentPropertyId"><value>not-a-number</value></metric>
    </propertyMetrics>
  </informationAndMetrics>
</reportData>"#;

    #[test]
    fn specification_applies_exclude_list_before_building() {
        let spec =
            build_report_specification(&[100, 200], ReportWindow { from_year: 2021, to_year: 2024 }, &[100])
                .expect("spec");
        assert!(!spec.contains("<id>100</id>"));
        assert!(spec.contains("<id>200</id>"));
        assert!(spec.contains("<year>2021</year>"));
        assert!(spec.contains("<year>2024</year>"));
        assert!(spec.contains("<interval>YEARLY</interval>"));
    }

    #[test]
    fn specification_refuses_an_empty_id_list() {
        let err = build_report_specification(
            &[100],
            ReportWindow { from_year: 2021, to_year: 2024 },
            &[100],
        )
        .expect_err("nothing left to request");
        assert!(matches!(err, EspmError::NoPropertiesRequested));
    }

    #[test]
    fn property_listing_parses_link_ids() {
        let xml = r#"<response>
          <links>
            <link id="100" hint="Building A"/>
            <link id="200" hint="Building B"/>
            <link id="bogus" hint="Broken"/>
          </links>
        </response>"#;
        let ids = parse_property_list(xml.as_bytes()).expect("listing");
        assert_eq!(ids, vec![100, 200]);
    }

    #[test]
    fn report_parses_one_group_per_property_year() {
        let report = parse_report(SAMPLE_REPORT.as_bytes()).expect("report");
        assert_eq!(report.groups.len(), 2);
        assert_eq!(report.groups[0].property_id, "200");
        assert_eq!(report.groups[0].year.as_deref(), Some("2023"));
        assert_eq!(report.groups[1].year.as_deref(), Some("2024"));
    }

    #[test]
    fn extraction_maps_metric_names_to_fields() {
        let report = parse_report(SAMPLE_REPORT.as_bytes()).expect("report");
        let records = extract(&report);
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.property_id, 200);
        assert_eq!(first.data_year, "2023");
        assert_eq!(first.building_name.as_deref(), Some("Larcom City Hall"));
        assert_eq!(first.floor_area.as_deref(), Some("105000"));
        assert_eq!(first.site_eui.as_deref(), Some("88.4"));
        assert_eq!(first.energy_gap, GapStatus::Ok);
        assert_eq!(first.water_gap, GapStatus::PossibleIssue);
        assert_eq!(first.parent_property_id, Some(200));
        assert!(first.is_root_property());
        assert!(first.has_issue());
    }

    #[test]
    fn empty_and_structured_values_normalise_to_missing() {
        let report = parse_report(SAMPLE_REPORT.as_bytes()).expect("report");
        let records = extract(&report);
        let second = &records[1];

        // <value/> and a value holding nested elements both mean "missing".
        assert_eq!(second.water_intensity, None);
        assert_eq!(second.water_months_short, GapStatus::Unknown);
        // Unparseable parent id falls back to null.
        assert_eq!(second.parent_property_id, None);
        assert!(!second.has_issue());
    }

    #[test]
    fn groups_without_key_parts_are_skipped() {
        let xml = r#"<reportData><informationAndMetrics>
          <propertyMetrics propertyId="glitch" year="2023">
            <metric name="propertyName"><value>Broken Id</value></metric>
          </propertyMetrics>
          <propertyMetrics propertyId="300">
            <metric name="propertyName"><value>No Year</value></metric>
          </propertyMetrics>
          <propertyMetrics propertyId="400" year="2024"/>
        </informationAndMetrics></reportData>"#;
        let records = extract(&parse_report(xml.as_bytes()).expect("report"));
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].property_id, 400);
        assert_eq!(records[0].building_name, None);
    }

    #[test]
    fn excluded_listing_entry_never_reaches_the_specification() {
        // Listing carries both ids; 100 is configured out.
        let listing = r#"<response><links>
          <link id="100"/><link id="200"/>
        </links></response>"#;
        let ids = parse_property_list(listing.as_bytes()).expect("listing");
        let spec = build_report_specification(
            &ids,
            ReportWindow { from_year: 2023, to_year: 2024 },
            &[100],
        )
        .expect("spec");
        assert!(!spec.contains("<id>100</id>"));

        let report = parse_report(SAMPLE_REPORT.as_bytes()).expect("report");
        let records = extract(&report);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.property_id == 200));
        let years: Vec<&str> = records.iter().map(|r| r.data_year.as_str()).collect();
        assert_eq!(years, vec!["2023", "2024"]);
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_espm_error(&EspmError::Status { status: 503, url: "u".into() }),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_espm_error(&EspmError::EmptyReport),
            RetryDisposition::NonRetryable
        );
    }
}
