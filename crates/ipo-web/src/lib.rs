//! JSON API over the reconciled IPO and GMP store.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use ipo_core::{Clock, Ipo, IpoStatus};
use ipo_storage::IpoStore;
use ipo_sync::{best_match, list_recent_reports, match_gmp_to_ipo, match_gmp_to_ipo_inner, MatchedIpo, RunReport};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "ipo-web";

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn IpoStore>,
    pub clock: Arc<dyn Clock>,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(store: Arc<dyn IpoStore>, clock: Arc<dyn Clock>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            clock,
            workspace_root: workspace_root.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct IposQuery {
    status: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct IpoPage {
    pub items: Vec<MatchedIpo>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/ipos", get(ipos_handler))
        .route("/api/ipos/active", get(active_ipos_handler))
        .route("/api/ipos/{key}", get(ipo_detail_handler))
        .route("/api/gmp", get(gmp_handler))
        .route("/api/reports", get(reports_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn ipos_handler(State(state): State<Arc<AppState>>, Query(query): Query<IposQuery>) -> Response {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(raw) => match IpoStatus::parse(raw) {
            Some(status) => Some(status),
            None => return json_error(StatusCode::BAD_REQUEST, format!("unknown status {raw:?}")),
        },
    };

    match load_live_ipos(&state).await {
        Ok(ipos) => {
            let ipos = ipos
                .into_iter()
                .filter(|ipo| status.map_or(true, |s| ipo.status == s))
                .collect::<Vec<_>>();
            match state.store.list_gmp().await {
                Ok(gmps) => Json(paginate(match_gmp_to_ipo(&ipos, &gmps), &query)).into_response(),
                Err(err) => server_error(err),
            }
        }
        Err(err) => server_error(err),
    }
}

async fn active_ipos_handler(State(state): State<Arc<AppState>>) -> Response {
    let ipos = match load_live_ipos(&state).await {
        Ok(ipos) => ipos,
        Err(err) => return server_error(err),
    };
    let active = ipos
        .into_iter()
        .filter(|ipo| ipo.status == IpoStatus::Active)
        .collect::<Vec<_>>();
    match state.store.list_gmp().await {
        Ok(gmps) => Json(match_gmp_to_ipo_inner(&active, &gmps)).into_response(),
        Err(err) => server_error(err),
    }
}

async fn ipo_detail_handler(State(state): State<Arc<AppState>>, AxumPath(key): AxumPath<String>) -> Response {
    let ipo = match state.store.find_ipo(&key).await {
        Ok(Some(ipo)) => ipo.with_live_status(state.clock.now()),
        Ok(None) => return json_error(StatusCode::NOT_FOUND, format!("no ipo for {key:?}")),
        Err(err) => return server_error(err),
    };
    match state.store.list_gmp().await {
        Ok(gmps) => {
            let gmp = best_match(&ipo, &gmps);
            Json(MatchedIpo { ipo, gmp }).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn gmp_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_gmp().await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => server_error(err),
    }
}

async fn reports_handler(State(state): State<Arc<AppState>>, Query(query): Query<ReportsQuery>) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    match list_recent_reports(&state.workspace_root.join("reports"), limit).await {
        Ok(reports) => Json::<Vec<RunReport>>(reports).into_response(),
        Err(err) => server_error(err),
    }
}

/// Stored status is advisory; what callers see is recomputed for now.
async fn load_live_ipos(state: &AppState) -> anyhow::Result<Vec<Ipo>> {
    let now = state.clock.now();
    Ok(state
        .store
        .list_ipos()
        .await?
        .into_iter()
        .map(|ipo| ipo.with_live_status(now))
        .collect())
}

fn paginate(rows: Vec<MatchedIpo>, query: &IposQuery) -> IpoPage {
    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total = rows.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    IpoPage {
        items: rows.into_iter().skip(start).take(per_page).collect(),
        page,
        per_page,
        total,
        total_pages,
    }
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use http_body_util::BodyExt;
    use ipo_core::{FixedClock, GmpSnapshot};
    use ipo_storage::MemoryIpoStore;
    use serde_json::Value;
    use tower::ServiceExt;

    // 10:00 IST, 9 Dec 2025
    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 9, 4, 30, 0).single().unwrap()
    }

    fn day(offset: i64) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(2025, 12, 9).map(|d| d + Duration::days(offset))
    }

    async fn seeded_store() -> Arc<MemoryIpoStore> {
        let store = Arc::new(MemoryIpoStore::new());

        let mut wakefit = Ipo::named("Wakefit Innovations Ltd.", now());
        wakefit.stock_id = Some("WAKEFIT01".into());
        wakefit.open_date = day(-1);
        wakefit.close_date = day(1);
        // stale stored status; reads must recompute it
        wakefit.status = IpoStatus::Upcoming;
        store.upsert_ipo(&wakefit).await.unwrap();

        let mut acme = Ipo::named("Acme Widgets Ltd", now());
        acme.open_date = day(-2);
        acme.close_date = day(2);
        store.upsert_ipo(&acme).await.unwrap();

        let mut kfin = Ipo::named("KFin Technologies Limited", now());
        kfin.stock_id = Some("KFIN123".into());
        kfin.open_date = day(-20);
        kfin.close_date = day(-17);
        kfin.listing_date = day(-12);
        store.upsert_ipo(&kfin).await.unwrap();

        let mut gmp = GmpSnapshot::new("Wakefit Innovations IPO", "board", now());
        gmp.gmp_value = Some(12.0);
        store.upsert_gmp(&gmp).await.unwrap();

        let mut renamed = GmpSnapshot::new("Registrar Co Mainboard", "board", now());
        renamed.stock_id = Some("KFIN123".into());
        store.upsert_gmp(&renamed).await.unwrap();

        store
    }

    fn workspace_root() -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    async fn test_app() -> Router {
        let store = seeded_store().await;
        app(AppState::new(store, Arc::new(FixedClock(now())), workspace_root()))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = get_json(test_app().await, "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn ipo_list_is_an_outer_join_with_live_status() {
        let (status, body) = get_json(test_app().await, "/api/ipos").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 3);
        let items = body["items"].as_array().unwrap();
        let wakefit = items.iter().find(|i| i["ipo"]["name"] == "Wakefit Innovations Ltd.").unwrap();
        assert_eq!(wakefit["ipo"]["status"], "ACTIVE");
        assert_eq!(wakefit["gmp"]["rule"], "company_code");
        let acme = items.iter().find(|i| i["ipo"]["name"] == "Acme Widgets Ltd").unwrap();
        assert!(acme["gmp"].is_null());
        let kfin = items.iter().find(|i| i["ipo"]["stock_id"] == "KFIN123").unwrap();
        assert_eq!(kfin["gmp"]["rule"], "stock_id");
        assert_eq!(kfin["ipo"]["status"], "LISTED");
    }

    #[tokio::test]
    async fn ipo_list_filters_and_paginates() {
        let (_, body) = get_json(test_app().await, "/api/ipos?status=active&per_page=1&page=9").await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["total_pages"], 2);
        assert_eq!(body["page"], 2);
        assert_eq!(body["items"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(test_app().await, "/api/ipos?status=sideways").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("sideways"));
    }

    #[tokio::test]
    async fn active_view_is_an_inner_join() {
        let (status, body) = get_json(test_app().await, "/api/ipos/active").await;
        assert_eq!(status, StatusCode::OK);
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["ipo"]["stock_id"], "WAKEFIT01");
    }

    #[tokio::test]
    async fn detail_by_slug_or_stock_id() {
        let app = test_app().await;
        let (status, body) = get_json(app.clone(), "/api/ipos/acme-widgets").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ipo"]["name"], "Acme Widgets Ltd");
        assert_eq!(body["ipo"]["status"], "ACTIVE");

        let (_, body) = get_json(app.clone(), "/api/ipos/KFIN123").await;
        assert_eq!(body["gmp"]["snapshot"]["ipo_name"], "Registrar Co Mainboard");

        let (status, body) = get_json(app, "/api/ipos/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn gmp_rows_are_listed() {
        let (status, body) = get_json(test_app().await, "/api/gmp").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reports_come_from_the_reports_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let report = RunReport::from_sources(
            uuid::Uuid::new_v4(),
            ipo_sync::SyncKind::Gmp,
            now(),
            now(),
            Vec::new(),
        );
        ipo_sync::report::write_run_report(&tmp.path().join("reports"), &report).await.unwrap();

        let state = AppState::new(seeded_store().await, Arc::new(FixedClock(now())), tmp.path());
        let (status, body) = get_json(app(state), "/api/reports?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["kind"], "gmp");
        assert_eq!(body[0]["completeness"], 1.0);
    }

    struct BrokenStore;

    #[async_trait]
    impl IpoStore for BrokenStore {
        async fn upsert_ipo(&self, _ipo: &Ipo) -> anyhow::Result<Ipo> {
            anyhow::bail!("database unavailable")
        }
        async fn upsert_gmp(&self, _snapshot: &GmpSnapshot) -> anyhow::Result<GmpSnapshot> {
            anyhow::bail!("database unavailable")
        }
        async fn list_ipos(&self) -> anyhow::Result<Vec<Ipo>> {
            anyhow::bail!("database unavailable")
        }
        async fn find_ipo(&self, _key: &str) -> anyhow::Result<Option<Ipo>> {
            anyhow::bail!("database unavailable")
        }
        async fn list_gmp(&self) -> anyhow::Result<Vec<GmpSnapshot>> {
            anyhow::bail!("database unavailable")
        }
    }

    #[tokio::test]
    async fn store_errors_are_json_500s() {
        let state = AppState::new(Arc::new(BrokenStore), Arc::new(FixedClock(now())), workspace_root());
        let (status, body) = get_json(app(state), "/api/ipos").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "database unavailable");
    }
}
