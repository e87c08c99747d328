//! Server administration: databases, admin accounts and users.
//!
//! These calls need admin credentials once the server has any admin account.

use reqwest::Method;
use serde_json::{Value as JsonValue, json};
use tracing::info;

use docmap_core::error::{DocumentError, DocumentResult};

use crate::{store::CouchDbStore, transport::HttpRequest};

fn user_document_id(username: &str) -> String {
    format!("org.couchdb.user:{username}")
}

impl CouchDbStore {
    pub async fn create_db(&self, name: &str) -> DocumentResult<()> {
        self.request(HttpRequest::new(Method::PUT, [name])).await?;
        info!(database = name, "created database");

        Ok(())
    }

    pub async fn delete_db(&self, name: &str) -> DocumentResult<()> {
        self.request(HttpRequest::new(Method::DELETE, [name])).await?;
        info!(database = name, "deleted database");

        Ok(())
    }

    pub async fn create_admin(&self, username: &str, password: &str) -> DocumentResult<()> {
        self.request(HttpRequest::new(Method::PUT, ["_config", "admins", username]).json(&json!(password))?)
            .await?;
        info!(username, "created admin");

        Ok(())
    }

    pub async fn delete_admin(&self, username: &str) -> DocumentResult<()> {
        self.request(HttpRequest::new(Method::DELETE, ["_config", "admins", username]))
            .await?;
        info!(username, "deleted admin");

        Ok(())
    }

    pub async fn create_user(&self, username: &str, password: &str, roles: &[&str]) -> DocumentResult<()> {
        let id = user_document_id(username);
        let body = json!({
            "_id": id,
            "name": username,
            "password": password,
            "roles": roles,
            "type": "user",
        });

        self.request(HttpRequest::new(Method::PUT, ["_users", id.as_str()]).json(&body)?)
            .await?;
        info!(username, "created user");

        Ok(())
    }

    pub async fn delete_user(&self, username: &str) -> DocumentResult<()> {
        let id = user_document_id(username);
        let user = self
            .request_json(HttpRequest::new(Method::GET, ["_users", id.as_str()]))
            .await?;
        let revision = user
            .get("_rev")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| DocumentError::database(format!("user {username} carries no revision")))?;

        self.request(HttpRequest::new(Method::DELETE, ["_users", id.as_str()]).query("rev", revision))
            .await?;
        info!(username, "deleted user");

        Ok(())
    }
}
