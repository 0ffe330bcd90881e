//! Offline walkthrough of the patient records demo on the in-process store.

use csfle::demo::{resolve_data_key, run_demo, DemoSettings};
use csfle::prelude::*;
use csfle_key_file::generate_master_key;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("csfle medical records example");
    println!("=============================\n");

    let dir = tempfile::tempdir()?;
    let key_path = dir.path().join("master-key.txt");
    let master_key = generate_master_key(&key_path)?;
    println!("✓ Master key written to {}\n", key_path.display());

    let config = CsfleConfig::default();
    let backend = MemoryBackend::new();
    let manager = KeyVaultManager::new(
        backend.key_vault(master_key.clone()),
        config.key_vault_namespace.clone(),
    );

    let key_id = resolve_data_key(&manager, &config).await?;
    let again = manager.find_or_create_data_key(&config.key_alt_name).await?;
    println!("Data key `{}`: {key_id}", config.key_alt_name);
    println!("  - Second lookup returns the same id: {}\n", key_id == again);

    let schema = build_schema_for_key(key_id, config.encrypted_namespace.clone(), &config.fields)?;
    println!("Encrypted fields in {}:", schema.namespace());
    for (path, directive) in schema.encrypted_fields() {
        println!("  - {path}: {} ({})", directive.bson_type, directive.algorithm.as_str());
    }
    println!();

    let report = run_demo(&backend, DemoSettings::from_config(&config, master_key, schema)).await?;

    println!("Encryption-aware client, find by ssn:");
    println!("{}\n", serde_json::to_string_pretty(&report.encrypted_view)?);
    println!("Plain client, find by name:");
    println!("{}", serde_json::to_string_pretty(&report.plain_view)?);

    Ok(())
}
