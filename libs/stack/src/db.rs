//! Admin-side driver for the shared database cluster. A connection is opened
//! per reconcile tick and dropped on return; nothing here is cached between
//! ticks.

use crate::names::logical_name;
use crate::services::collection_spec;

use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, Credential, IndexOptions};
use mongodb::{Client, IndexModel};
use stackop_operator::error::{Error, Result};
use tracing::{debug, info};

/// `dropUser` on a principal that does not exist.
pub const CODE_USER_NOT_FOUND: i32 = 11;
/// `dropDatabase`/collection commands on a namespace that does not exist.
pub const CODE_NAMESPACE_NOT_FOUND: i32 = 26;
const CODE_NAMESPACE_EXISTS: i32 = 48;

pub struct DbAdmin {
    client: Client,
}

/// Server error code of a failed command, if the error was a command error.
pub fn command_error_code(e: &mongodb::error::Error) -> Option<i32> {
    match &*e.kind {
        mongodb::error::ErrorKind::Command(c) => Some(c.code),
        _ => None,
    }
}

fn db_error(context: impl Into<String>) -> impl FnOnce(mongodb::error::Error) -> Error {
    let context = context.into();
    move |e| Error::DatabaseError(context, Box::new(e))
}

/// `readWrite` on each per-service database, the only grant a stack user
/// ever gets.
fn readwrite_roles(databases: &[String]) -> Vec<Document> {
    databases
        .iter()
        .map(|db| doc! { "role": "readWrite", "db": db })
        .collect()
}

impl DbAdmin {
    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(db_error(format!("failed to parse database URI {uri:?}")))?;
        options.app_name = Some("stackop".to_string());
        options.credential = Some(
            Credential::builder()
                .username(user.to_string())
                .password(password.to_string())
                .build(),
        );
        let client = Client::with_options(options)
            .map_err(db_error("failed to build database client"))?;
        Ok(Self { client })
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(db_error("database ping failed"))?;
        Ok(())
    }

    /// Remove the per-stack user. Absent user is the expected state on a
    /// fresh stack and on cleanup retries.
    pub async fn drop_user(&self, user: &str) -> Result<()> {
        let result = self
            .client
            .database("admin")
            .run_command(doc! { "dropUser": user })
            .await;
        match result {
            Ok(_) => {
                debug!(msg = "dropped database user", user);
                Ok(())
            }
            Err(e) if command_error_code(&e) == Some(CODE_USER_NOT_FOUND) => Ok(()),
            Err(e) => Err(db_error(format!("failed to drop user {user}"))(e)),
        }
    }

    /// Create the per-stack user with `readWrite` on each database.
    /// Callers drop any existing user first so a replay after a crash
    /// converges on exactly one principal.
    pub async fn create_user(
        &self,
        user: &str,
        password: &str,
        databases: &[String],
    ) -> Result<()> {
        self.client
            .database("admin")
            .run_command(doc! {
                "createUser": user,
                "pwd": password,
                "roles": readwrite_roles(databases),
            })
            .await
            .map_err(db_error(format!("failed to create user {user}")))?;
        info!(msg = "created database user", user, databases = databases.len());
        Ok(())
    }

    /// Drop one per-service database. Returns false when the database was
    /// already gone, which is routine on cleanup retries.
    pub async fn drop_database(&self, name: &str) -> Result<bool> {
        let result = self
            .client
            .database(name)
            .run_command(doc! { "dropDatabase": 1 })
            .await;
        match result {
            Ok(_) => {
                info!(msg = "dropped database", name);
                Ok(true)
            }
            Err(e) if command_error_code(&e) == Some(CODE_NAMESPACE_NOT_FOUND) => {
                debug!(msg = "database already absent", name);
                Ok(false)
            }
            Err(e) => Err(db_error(format!("failed to drop database {name}"))(e)),
        }
    }

    /// Create the collection and assert the index set a logical service
    /// expects in its database. Replay-safe: existing collections and
    /// indexes are left alone.
    pub async fn ensure_collection_set(&self, db_name: &str, service: &str) -> Result<()> {
        let logical = logical_name(service);
        let spec = collection_spec(logical).ok_or_else(|| {
            Error::ValidationError(format!(
                "no collection set registered for logical service {logical:?}"
            ))
        })?;

        let database = self.client.database(db_name);
        if let Err(e) = database.create_collection(spec.collection).await {
            if command_error_code(&e) != Some(CODE_NAMESPACE_EXISTS) {
                return Err(db_error(format!(
                    "failed to create collection {}.{}",
                    db_name, spec.collection
                ))(e));
            }
        }

        let collection = database.collection::<Document>(spec.collection);
        for index in spec.indexes {
            let key = index.key;
            let model = IndexModel::builder()
                .keys(doc! { key: 1 })
                .options(IndexOptions::builder().unique(index.unique).build())
                .build();
            collection.create_index(model).await.map_err(db_error(format!(
                "failed to create index {} on {}.{}",
                index.key, db_name, spec.collection
            )))?;
        }
        debug!(
            msg = "collection set ensured",
            database = db_name,
            collection = spec.collection
        );
        Ok(())
    }
}
