use crate::broker_session::BrokerSession;
use crate::db::DatabaseService;
use crate::models::StoredActivity;
use rocket::fairing::{Fairing, Info, Kind};
use rocket::http::Status;
use rocket::serde::{json::Json, Serialize};
use rocket::{get, routes, Build, Rocket, State};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

/// API Response
#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ApiResponse {
    status: String,
    message: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct HealthResponse {
    session: String,
}

#[derive(Serialize)]
#[serde(crate = "rocket::serde")]
struct ActivityResponse {
    collection: String,
    records: Vec<StoredActivity>,
}

/// CORS Fairing for Rocket
pub struct Cors;

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "CORS",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Origin", "*"));
        res.set_header(rocket::http::Header::new("Access-Control-Allow-Methods", "GET"));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "Content-Type",
        ));
    }
}

#[get("/")]
fn root_handler() -> Json<ApiResponse> {
    Json(ApiResponse {
        status: "success".to_string(),
        message: "Traffic bridge activity API".to_string(),
    })
}

#[get("/health")]
async fn health(session: &State<Arc<BrokerSession>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        session: session.state().await.to_string(),
    })
}

/// Latest record of a collection
#[get("/activity/<collection>/last")]
fn last_activity(
    collection: &str,
    db: &State<Arc<DatabaseService>>,
) -> Result<Json<StoredActivity>, Status> {
    match db.last_record(collection) {
        Ok(Some(record)) => Ok(Json(record)),
        Ok(None) => Err(Status::NotFound),
        Err(e) => {
            error!("Failed to read activity from '{}': {}", collection, e);
            Err(Status::InternalServerError)
        }
    }
}

/// Latest `limit` records of a collection, newest first
#[get("/activity/<collection>?<limit>")]
fn activity(
    collection: &str,
    limit: Option<usize>,
    db: &State<Arc<DatabaseService>>,
) -> Result<Json<ActivityResponse>, Status> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    match db.last_records(collection, limit) {
        Ok(records) => Ok(Json(ActivityResponse {
            collection: collection.to_string(),
            records,
        })),
        Err(e) => {
            error!("Failed to read activity from '{}': {}", collection, e);
            Err(Status::InternalServerError)
        }
    }
}

pub fn build_rest_server(
    db_service: Arc<DatabaseService>,
    session: Arc<BrokerSession>,
) -> Rocket<Build> {
    rocket::build()
        .manage(db_service)
        .manage(session)
        .mount("/", routes![root_handler, health, last_activity, activity])
        .attach(Cors)
}

/// Serves the API until `shutdown` fires.
pub async fn run_rest_server(rocket: Rocket<Build>, mut shutdown: watch::Receiver<bool>) {
    let rocket = match rocket.ignite().await {
        Ok(rocket) => rocket,
        Err(e) => {
            error!("Failed to start REST API: {}", e);
            return;
        }
    };

    let handle = rocket.shutdown();
    tokio::spawn(async move {
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        handle.notify();
    });

    match rocket.launch().await {
        Ok(_) => info!("REST API stopped."),
        Err(e) => error!("REST API terminated with error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker_session::SessionConfig;
    use crate::db::ActivityStore;
    use crate::models::{ActivityRecord, Category};
    use rocket::local::asynchronous::Client;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn client() -> (TempDir, Arc<DatabaseService>, Client) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rest.db");
        let db = Arc::new(DatabaseService::new(path.to_str().unwrap()).unwrap());
        db.initialize_db().unwrap();

        let session = BrokerSession::new(SessionConfig {
            host: "127.0.0.1".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "rest_test".to_string(),
            control_topic: "ArduinoTrafficController".to_string(),
            retry_interval: Duration::from_millis(100),
            max_retries: 0,
        });

        let client = Client::tracked(build_rest_server(db.clone(), session))
            .await
            .unwrap();
        (dir, db, client)
    }

    #[rocket::async_test]
    async fn health_reports_session_state() {
        let (_dir, _db, client) = client().await;
        let response = client.get("/health").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body = response.into_string().await.unwrap();
        assert_eq!(body, r#"{"session":"disconnected"}"#);
    }

    #[rocket::async_test]
    async fn activity_lists_newest_first() {
        let (_dir, db, client) = client().await;
        let first = db
            .add("ModeSwitch", &ActivityRecord::now(&Category::ModeSwitch))
            .unwrap();
        let second = db
            .add("ModeSwitch", &ActivityRecord::now(&Category::ModeSwitch))
            .unwrap();

        let response = client.get("/activity/ModeSwitch?limit=1").dispatch().await;
        assert_eq!(response.status(), Status::Ok);
        let body: serde_json::Value =
            serde_json::from_str(&response.into_string().await.unwrap()).unwrap();
        let records = body["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["id"], second);
        assert_ne!(first, second);
    }

    #[rocket::async_test]
    async fn missing_last_record_is_not_found() {
        let (_dir, _db, client) = client().await;
        let response = client.get("/activity/LaneA/last").dispatch().await;
        assert_eq!(response.status(), Status::NotFound);
    }
}
