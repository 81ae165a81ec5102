use mongodb::{bson::doc, Client, Database};

use crate::errors::Result;

pub async fn get_db_client(database_url: &str, db_name: &str) -> Result<Database> {
    let client = Client::with_uri_str(database_url).await?;
    let db = client.database(db_name);

    match db.list_collection_names().await {
        Ok(collections) => {
            tracing::info!("✅ Connected to database: {}", db_name);
            tracing::debug!("📂 Collections found: {:?}", collections);

            if !collections.iter().any(|c| c == "orders") {
                tracing::warn!("⚠️ 'orders' collection not found; reconciliation will see no sales");
            }
        }
        Err(e) => {
            tracing::error!("❌ Database '{}' may not exist or is inaccessible: {}", db_name, e);
            return Err(e.into());
        }
    }

    Ok(db)
}

pub async fn ping(db: &Database) -> bool {
    db.run_command(doc! { "ping": 1 }).await.is_ok()
}
