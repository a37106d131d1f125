use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use cv_api::{ExperimentSession, HarnessConfig};
use cv_core::{DType, DenseTensor};
use cv_model::{
    MethodSpec, ModelSnapshot, RocEntry, SnapshotFile, TestEntry, TrainHistory, WantedEpoch,
    epoch_dir_name,
};
use cv_record::{LossRecorder, record_file_name};
use cv_registry::{FilterCondition, ModelFilter, WhichRecorders};
use cv_report::ReportOptions;
use cv_results::Source;
use cv_runtime::EvidenceKind;
use serde_json::json;

const DATASETS: &str = r#"{
    "digits": {"shape": [1, 8, 8], "classes": ["zero", "one"]},
    "glyphs": {"shape": [1, 8, 8], "classes": ["alpha", "beta"]}
}"#;

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cv_api_smoke_{tag}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("scratch dir should be creatable");
    dir
}

fn save_model(dir: &Path, job: u64, set: &str, ood_fpr: f64) {
    let mut meta = SnapshotFile::default();
    meta.job_number = job;
    meta.architecture.kind = "cvae".to_string();
    meta.training.set = set.to_string();
    meta.training.epochs = 4;
    meta.trained = 4;
    meta.num_labels = 2;
    meta.predict_methods = vec![MethodSpec::parse("iws").expect("method")];
    meta.ood_methods = vec![MethodSpec::parse("kl").expect("method")];

    let mut tests = BTreeMap::new();
    tests.insert(
        "iws".to_string(),
        TestEntry {
            n: 300,
            epochs: 4,
            accuracy: 0.875,
            ..TestEntry::default()
        },
    );
    let other = if set == "digits" { "glyphs" } else { "digits" };
    let mut by_method = BTreeMap::new();
    by_method.insert(
        "kl".to_string(),
        RocEntry {
            n: 300,
            epochs: 4,
            fpr: vec![ood_fpr / 2.0, ood_fpr],
            tpr: vec![0.9, 0.95],
            auc: Some(0.8),
            thresholds: vec![2.0, 1.0],
        },
    );
    let mut by_set = BTreeMap::new();
    by_set.insert(other.to_string(), by_method);

    ModelSnapshot {
        dir: dir.to_path_buf(),
        meta,
        testing: [(4, tests)].into_iter().collect(),
        ood_results: [(4, by_set)].into_iter().collect(),
        history: TrainHistory {
            epochs: 4,
            ..TrainHistory::default()
        },
    }
    .save()
    .expect("snapshot should save");
}

fn save_recorder(model: &Path, set: &str, batches: usize) {
    let mut recorder = LossRecorder::new(100).expect("recorder");
    for b in 0..batches {
        let mut batch = BTreeMap::new();
        batch.insert(
            "iws".to_string(),
            DenseTensor::from_samples((0..100).map(|i| (b * 100 + i) as f64).collect(), DType::F32),
        );
        recorder.append_batch(&batch).expect("append");
    }
    let path = model
        .join("samples")
        .join(epoch_dir_name(4))
        .join(record_file_name(set));
    recorder.save(&path).expect("save recorder");
}

fn session(tag: &str) -> (PathBuf, ExperimentSession) {
    let root = scratch_dir(tag);
    let datasets = root.join("datasets.json");
    fs::write(&datasets, DATASETS).expect("write datasets");
    let jobs = root.join("jobs");

    save_model(&jobs.join("digits").join("000011"), 11, "digits", 0.2);
    save_model(&jobs.join("digits").join("000012"), 12, "digits", 0.1);
    save_model(&jobs.join("glyphs").join("000021"), 21, "glyphs", 0.4);
    save_recorder(&jobs.join("digits").join("000011"), "digits", 10);

    let config = HarnessConfig {
        job_dir: jobs,
        dataset_config: Some(datasets),
        ..HarnessConfig::default()
    };
    let session = ExperimentSession::new(config).expect("session");
    (root, session)
}

#[test]
fn availability_counts_every_source() {
    let (root, mut session) = session("availability");
    let model = session.config().job_dir.join("digits").join("000011");

    let table = session
        .availability(&model, |query| {
            query.ood_methods = cv_model::MethodSelection::Only(Vec::new());
        })
        .expect("availability");
    assert_eq!(table.wanted_epoch, Some(4));
    let epoch = table.epoch(4).expect("epoch 4");
    let set = &epoch.sets["digits"];
    assert_eq!(set.min_samples, 400);
    assert_eq!(set.count(Source::Json, "iws"), 300);
    assert_eq!(set.count(Source::Recorders, "iws"), 1000);
    assert_eq!(set.count(Source::Compute, "iws"), 1600);
    assert_eq!(set.gain(Source::Compute), 600);
    assert_eq!(set.gain(Source::Recorders), 700);
    assert_eq!(set.gain(Source::Json), 0);
    assert_eq!(epoch.all_sets.anywhere, 1300);
    assert!(epoch.rec_dir.is_some());

    let scan = session.recorders(&model, 4).expect("recorders");
    assert_eq!(scan.recorders["digits"].recorded_samples(), 1000);
    assert!(scan.failures.is_empty());

    assert!(session.evidence().iter().any(|e| e.kind == EvidenceKind::Reconcile));
    let _ = fs::remove_dir_all(root);
}

#[test]
fn listing_report_and_remote_files() {
    let (root, mut session) = session("listing");

    let all = session
        .list_models(None, true, WantedEpoch::Last)
        .expect("listing rebuilds the cache");
    assert_eq!(all.len(), 3);
    assert!(session.config().job_dir.join("models.json").is_file());

    let filter = ModelFilter::new()
        .with("set", FilterCondition::Equals(json!("digits")))
        .expect("set is a filter key");
    let digits = session
        .list_models(Some(&filter), true, WantedEpoch::Last)
        .expect("flash listing");
    assert_eq!(digits.len(), 2);

    let tables = session.report(
        &all,
        &ReportOptions {
            sorting_keys: vec!["glyphs:first:0.95".to_string()],
            ..ReportOptions::default()
        },
    );
    assert_eq!(tables.len(), 2);
    let table = &tables["digits"];
    let job = table
        .index_names
        .iter()
        .position(|n| n == "job")
        .expect("job column");
    assert_eq!(table.rows[0].index[job], "12");
    let fpr = table.value(0, "glyphs", "first", "0.95").expect("fpr");
    assert!((fpr - 10.0).abs() < 1e-9);
    let rate = table.value(0, "digits", "first", "rate").expect("rate");
    assert!((rate - 87.5).abs() < 1e-9);
    assert_eq!(table.to_csv().expect("csv output").lines().count(), 5);

    let found = session.find_jobs(&[21, 99]);
    assert_eq!(found.keys().copied().collect::<Vec<_>>(), vec![21]);

    let recorded = session.config().job_dir.join("digits").join("000011");
    let missing = session
        .remote_files(
            std::slice::from_ref(&recorded),
            WantedEpoch::Last,
            WhichRecorders::All,
            false,
        )
        .expect("remote files");
    let missing: Vec<PathBuf> = missing.into_iter().map(|(_, path)| path).collect();
    let epoch_dir = recorded.join("samples").join(epoch_dir_name(4));
    assert_eq!(
        missing,
        vec![
            epoch_dir.join("record-glyphs.json"),
            epoch_dir.join("record-digits90.json"),
        ]
    );

    let evidence = root.join("evidence.jsonl");
    session.write_evidence(&evidence).expect("evidence written");
    let written = fs::read_to_string(&evidence).expect("evidence readable");
    assert_eq!(written.lines().count(), session.evidence_len());
    let _ = fs::remove_dir_all(root);
}
