use std::path::Path;

use crate::commands::common::{
    format_record_lines, mark_local_change, normalize_collection, normalize_record_id,
    open_database, parse_record_body, record_to_list_item, RecordListItem,
};
use crate::error::CliError;

pub async fn run_put(collection: &str, id: &str, json: &str, db_path: &Path) -> Result<(), CliError> {
    let collection = normalize_collection(collection)?;
    let id = normalize_record_id(id)?;
    let body = parse_record_body(&id, json)?;

    let db = open_database(db_path).await?;
    db.put_record(&collection, body).await?;
    mark_local_change(&db).await?;

    println!("Saved {collection}/{id}");
    Ok(())
}

pub async fn run_delete(collection: &str, id: &str, db_path: &Path) -> Result<(), CliError> {
    let collection = normalize_collection(collection)?;
    let id = normalize_record_id(id)?;

    let db = open_database(db_path).await?;
    if !db.delete_record(&collection, &id).await? {
        return Err(CliError::RecordNotFound { collection, id });
    }
    mark_local_change(&db).await?;

    println!("Deleted {collection}/{id}");
    Ok(())
}

pub async fn run_list(
    collection: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let collection = collection.map(normalize_collection).transpose()?;
    let db = open_database(db_path).await?;
    let records = db.list_records(collection.as_deref()).await?;

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
    } else if records.is_empty() {
        println!("No records.");
    } else {
        for line in format_record_lines(&records) {
            println!("{line}");
        }
    }

    Ok(())
}
