use idr_engine::hasher::hash_entity;
use idr_engine::orchestrator::{CancelToken, Orchestrator, RunOptions};
use idr_engine::table::{CsvTableStore, TableStore};
use std::fs;
use std::path::{Path, PathBuf};

fn create_test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("idr_engine_it_{}", name));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn create_enhanced_fixture(dir: &Path) {
    fs::write(
        dir.join("mapping.csv"),
        "person_id,id_value,id_type,source_context,priority,consent_status,effective_date,notes\n\
         PERSON_001,2,mobi_id,study_main,1,granted,2024-01-01,\n\
         PERSON_001,DD-0100-6247,mrn,study_main,1,granted,2024-01-01,\n\
         PERSON_002,2,mobi_id,study_secondary,1,revoked,,\n",
    )
    .unwrap();
    fs::write(
        dir.join("visits.csv"),
        "mobi_id,visit\n2,baseline\n7,followup\n",
    )
    .unwrap();
    fs::write(dir.join("labs.csv"), "mrn,result\nDD-0100-6247,negative\n").unwrap();
    fs::write(dir.join("secondary.csv"), "mobi_id,score\n2,9\n").unwrap();
    fs::write(
        dir.join("config.csv"),
        "mapping_file,mapping_id,source_file,source_id,id_type,source_context,processed\n\
         mapping.csv,id_value,visits.csv,mobi_id,mobi_id,study_main,False\n\
         mapping.csv,id_value,labs.csv,mrn,mrn,study_main,False\n\
         mapping.csv,id_value,secondary.csv,mobi_id,mobi_id,study_secondary,False\n",
    )
    .unwrap();
}

#[test]
fn test_end_to_end_enhanced_run() {
    let dir = create_test_dir("enhanced");
    create_enhanced_fixture(&dir);

    let store = CsvTableStore::new();
    let orchestrator = Orchestrator::new(&store);
    let summary = orchestrator
        .run(&dir.join("config.csv"), &RunOptions::default())
        .unwrap();

    assert_eq!(summary.files.len(), 3);
    assert!(summary.files.iter().all(|f| f.error.is_none()));

    let token = hash_entity("PERSON_001");

    // Training extracts: granted rows only, identifier replaced by the token.
    let visits_training = store.read_table(&dir.join("visits_training.csv")).unwrap();
    assert_eq!(visits_training.rows.len(), 1);
    assert_eq!(visits_training.rows[0], vec![token.clone(), "baseline".to_string()]);

    // The same entity reached through a different id type carries the same
    // token, preserving cross-file linkage.
    let labs_training = store.read_table(&dir.join("labs_training.csv")).unwrap();
    assert_eq!(labs_training.rows[0][0], token);

    // The revoked context produces an empty training extract.
    let secondary_training = store.read_table(&dir.join("secondary_training.csv")).unwrap();
    assert!(secondary_training.rows.is_empty());

    // Annotated originals: every row kept, values untouched, consent added.
    let visits = store.read_table(&dir.join("visits.csv")).unwrap();
    assert_eq!(visits.headers, vec!["mobi_id", "visit", "consent_status"]);
    assert_eq!(visits.rows[0], vec!["2", "baseline", "granted"]);
    assert_eq!(visits.rows[1], vec!["7", "followup", "ID not found"]);

    let secondary = store.read_table(&dir.join("secondary.csv")).unwrap();
    assert_eq!(secondary.rows[0], vec!["2", "9", "revoked"]);

    // Backups hold the pre-annotation originals.
    let backup = fs::read_to_string(dir.join("visits.csv.backup")).unwrap();
    assert_eq!(backup, "mobi_id,visit\n2,baseline\n7,followup\n");

    // Ledger documents the granted entity's full alias set; the revoked
    // entity is never hashed.
    let ledger = store.read_table(&dir.join("id_lookup_table.csv")).unwrap();
    let originals: Vec<&str> = ledger.rows.iter().map(|r| r[1].as_str()).collect();
    assert!(originals.contains(&"2"));
    assert!(originals.contains(&"DD-0100-6247"));
    assert!(ledger.rows.iter().all(|r| r[0] == "PERSON_001"));
    assert!(ledger.rows.iter().all(|r| r[2] == token));
    assert!(ledger.rows.iter().all(|r| r[6] == "True"));

    // Processed flags flipped to the literal True.
    let config = store.read_table(&dir.join("config.csv")).unwrap();
    assert!(config.rows.iter().all(|r| r[6] == "True"));
}

#[test]
fn test_second_run_is_idempotent() {
    let dir = create_test_dir("idempotent");
    create_enhanced_fixture(&dir);

    let store = CsvTableStore::new();
    let orchestrator = Orchestrator::new(&store);
    orchestrator
        .run(&dir.join("config.csv"), &RunOptions::default())
        .unwrap();

    let training_before = fs::read(dir.join("visits_training.csv")).unwrap();
    let annotated_before = fs::read(dir.join("visits.csv")).unwrap();
    let ledger_before = fs::read(dir.join("id_lookup_table.csv")).unwrap();

    let summary = orchestrator
        .run(&dir.join("config.csv"), &RunOptions::default())
        .unwrap();

    // Every file skips; nothing is re-hashed or rewritten.
    assert!(summary.files.iter().all(|f| f.skipped));
    assert_eq!(fs::read(dir.join("visits_training.csv")).unwrap(), training_before);
    assert_eq!(fs::read(dir.join("visits.csv")).unwrap(), annotated_before);
    assert_eq!(fs::read(dir.join("id_lookup_table.csv")).unwrap(), ledger_before);

    let config = store.read_table(&dir.join("config.csv")).unwrap();
    assert!(config.rows.iter().all(|r| r[6] == "True"));
}

#[test]
fn test_end_to_end_legacy_run_with_nested_files() {
    let dir = create_test_dir("legacy");
    fs::create_dir_all(dir.join("subfolder/deeper")).unwrap();
    fs::write(
        dir.join("table4.csv"),
        "mobi_id,MRN\nMB001,M001\nMB002,M002\nMB003,M003\n",
    )
    .unwrap();
    fs::write(
        dir.join("subfolder/table2.csv"),
        "MRN,data\nM001,x\nM002,y\n",
    )
    .unwrap();
    fs::write(
        dir.join("subfolder/deeper/table3.csv"),
        "mobi_id,data\nMB001,1\n",
    )
    .unwrap();
    // table3.csv is configured by bare name and found by recursive scan.
    fs::write(
        dir.join("config.csv"),
        "mapping_file,mapping_id,source_file,source_id,id_type,source_context,processed\n\
         table4.csv,MRN,subfolder/table2.csv,MRN,,,False\n\
         table4.csv,mobi_id,table3.csv,mobi_id,,,False\n",
    )
    .unwrap();

    let store = CsvTableStore::new();
    let orchestrator = Orchestrator::new(&store);
    let summary = orchestrator
        .run(&dir.join("config.csv"), &RunOptions::default())
        .unwrap();
    assert!(summary.files.iter().all(|f| f.error.is_none()));

    // Row co-occurrence in the mapping table links MRN and mobi_id values to
    // one entity, so related identifiers share a token across files.
    let table2_training = store
        .read_table(&dir.join("subfolder/table2_training.csv"))
        .unwrap();
    let table3_training = store
        .read_table(&dir.join("subfolder/deeper/table3_training.csv"))
        .unwrap();
    assert_eq!(table2_training.rows[0][0], table3_training.rows[0][0]);
    assert_eq!(table2_training.rows[0][0].len(), 64);

    // Legacy mapping files carry no consent column; everything is granted.
    let table2 = store.read_table(&dir.join("subfolder/table2.csv")).unwrap();
    assert!(table2.rows.iter().all(|r| r[2] == "granted"));

    // Only observed entities reach the ledger.
    let ledger = store.read_table(&dir.join("id_lookup_table.csv")).unwrap();
    let people: Vec<&str> = ledger.rows.iter().map(|r| r[0].as_str()).collect();
    assert!(people.contains(&"MB001"));
    assert!(people.contains(&"MB002"));
    assert!(!people.contains(&"MB003"));
}

#[test]
fn test_cancellation_leaves_files_untouched() {
    let dir = create_test_dir("cancel");
    create_enhanced_fixture(&dir);

    let store = CsvTableStore::new();
    let cancel = CancelToken::new();
    cancel.cancel();
    let orchestrator = Orchestrator::with_cancel(&store, cancel);
    let summary = orchestrator
        .run(&dir.join("config.csv"), &RunOptions::default())
        .unwrap();

    assert!(summary.files.is_empty());
    assert!(!dir.join("visits_training.csv").exists());
    assert!(!dir.join("visits.csv.backup").exists());
    let config = store.read_table(&dir.join("config.csv")).unwrap();
    assert!(config.rows.iter().all(|r| r[6] == "False"));
}

#[test]
fn test_per_file_failures_do_not_abort_the_run() {
    let dir = create_test_dir("failures");
    create_enhanced_fixture(&dir);
    fs::write(
        dir.join("config.csv"),
        "mapping_file,mapping_id,source_file,source_id,id_type,source_context,processed\n\
         mapping.csv,id_value,missing.csv,mobi_id,mobi_id,study_main,False\n\
         mapping.csv,id_value,visits.csv,mobi_id,mobi_id,study_main,False\n",
    )
    .unwrap();

    let store = CsvTableStore::new();
    let orchestrator = Orchestrator::new(&store);
    let summary = orchestrator
        .run(&dir.join("config.csv"), &RunOptions::default())
        .unwrap();

    assert_eq!(summary.files.len(), 2);
    assert!(summary.files[0].error.is_some());
    assert!(summary.files[1].error.is_none());
    assert!(dir.join("visits_training.csv").exists());

    // The failed row keeps its False flag for the next run.
    let config = store.read_table(&dir.join("config.csv")).unwrap();
    assert_eq!(config.rows[0][6], "False");
    assert_eq!(config.rows[1][6], "True");
}
