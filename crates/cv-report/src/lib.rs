#![forbid(unsafe_code)]

//! Result tables over model records.
//!
//! One table per training set. Rows are indexed by architecture and training
//! attributes; columns carry a three level header `(set, method, metric)`.
//! Rates are shown in percent, measures as they are.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};

use cv_results::ModelRecord;

pub const MEASURES_SET: &str = "measures";
const FIRST_METHOD: &str = "first";
const RATE_METRIC: &str = "rate";
const AUC_METRIC: &str = "auc";

#[derive(Debug, Clone, PartialEq, Default)]
pub enum MethodDisplay {
    /// Only the model's first listed method.
    #[default]
    First,
    /// Every method but the `first` alias.
    All,
    Only(Vec<String>),
}

impl MethodDisplay {
    fn shows(&self, method: &str) -> bool {
        match self {
            Self::First => method == FIRST_METHOD,
            Self::All => method != FIRST_METHOD,
            Self::Only(methods) => methods.iter().any(|m| m == method),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum MeasureLevel {
    None,
    #[default]
    Basic,
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportOptions {
    pub predict_methods: MethodDisplay,
    pub ood_methods: MethodDisplay,
    /// OOD sets to show, per training set; all tested sets when absent.
    pub ood_sets: BTreeMap<String, Vec<String>>,
    pub show_measures: MeasureLevel,
    pub tpr: Vec<f64>,
    /// Show true negative rates instead of false positive rates.
    pub tnr: bool,
    /// Index names (`job`, `K`, ...) or `set:method:metric` columns.
    pub sorting_keys: Vec<String>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            predict_methods: MethodDisplay::First,
            ood_methods: MethodDisplay::First,
            ood_sets: BTreeMap::new(),
            show_measures: MeasureLevel::Basic,
            tpr: vec![0.95],
            tnr: false,
            sorting_keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnKey {
    pub set: String,
    pub method: String,
    pub metric: String,
}

impl ColumnKey {
    fn new(set: &str, method: &str, metric: &str) -> Self {
        Self {
            set: set.to_string(),
            method: method.to_string(),
            metric: metric.to_string(),
        }
    }

    fn label(&self) -> String {
        format!("{}:{}:{}", self.set, self.method, self.metric)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub index: Vec<String>,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultTable {
    pub dataset: String,
    pub index_names: Vec<String>,
    pub columns: Vec<ColumnKey>,
    pub rows: Vec<Row>,
}

impl ResultTable {
    #[must_use]
    pub fn column(&self, set: &str, method: &str, metric: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.set == set && c.method == method && c.metric == metric)
    }

    #[must_use]
    pub fn value(&self, row: usize, set: &str, method: &str, metric: &str) -> Option<f64> {
        let column = self.column(set, method, metric)?;
        self.rows.get(row)?.values.get(column).copied().flatten()
    }

    /// Aligned plain text with the three header levels on separate lines.
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut cells: Vec<Vec<String>> = Vec::new();
        let pad = vec![String::new(); self.index_names.len()];
        let mut header_set = pad.clone();
        let mut header_method = pad;
        let mut header_metric = self.index_names.clone();
        for column in &self.columns {
            header_set.push(column.set.clone());
            header_method.push(column.method.clone());
            header_metric.push(column.metric.clone());
        }
        cells.push(header_set);
        cells.push(header_method);
        cells.push(header_metric);
        for row in &self.rows {
            let mut line = row.index.clone();
            line.extend(row.values.iter().map(|v| format_value(*v)));
            cells.push(line);
        }

        let widths: Vec<usize> = (0..self.index_names.len() + self.columns.len())
            .map(|i| {
                cells
                    .iter()
                    .filter_map(|line| line.get(i))
                    .map(|cell| cell.chars().count())
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        let mut out = String::new();
        for line in &cells {
            let rendered: Vec<String> = line
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:>width$}"))
                .collect();
            let _ = writeln!(out, "{}", rendered.join(" ").trim_end());
        }
        out
    }

    /// Three header records, then one record per row.
    pub fn to_csv(&self) -> Result<String, ReportError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        let pad = vec![String::new(); self.index_names.len()];
        for level in 0..3 {
            let index: &[String] = if level == 2 { &self.index_names } else { &pad };
            let headers = self.columns.iter().map(|c| match level {
                0 => c.set.as_str(),
                1 => c.method.as_str(),
                _ => c.metric.as_str(),
            });
            writer.write_record(index.iter().map(String::as_str).chain(headers))?;
        }
        for row in &self.rows {
            let values = row
                .values
                .iter()
                .map(|v| v.map(|v| v.to_string()).unwrap_or_default());
            let record = row.index.iter().cloned().chain(values);
            writer.write_record(record)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|error| ReportError::Csv(error.to_string()))?;
        String::from_utf8(bytes).map_err(|error| ReportError::Csv(error.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportError {
    Csv(String),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Csv(reason) => write!(f, "failed to write csv: {reason}"),
        }
    }
}

impl std::error::Error for ReportError {}

impl From<csv::Error> for ReportError {
    fn from(error: csv::Error) -> Self {
        Self::Csv(error.to_string())
    }
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
}

fn index_names(dataset: &str) -> Vec<String> {
    let mut names = Vec::new();
    if dataset.ends_with("-?") {
        names.push("h/o");
    }
    names.extend([
        "type",
        "depth",
        "features",
        "arch_code",
        "K",
        "options",
        "bn",
        "optim_str",
        "coder_dict",
        "forced_var",
        "L",
        "sigma_train",
        "sigma",
        "beta",
        "gamma",
        "job",
    ]);
    names.into_iter().map(str::to_string).collect()
}

fn index_value(record: &ModelRecord, name: &str) -> String {
    fn opt<T: ToString>(value: Option<&T>) -> String {
        value.map(ToString::to_string).unwrap_or_default()
    }
    match name {
        "h/o" => record.heldout_label.clone(),
        "type" => record.kind.clone(),
        "depth" => record.depth.to_string(),
        "features" => record.features.clone(),
        "arch_code" => record.arch_code.clone(),
        "K" => record.latent_dim.to_string(),
        "options" => record.options.clone(),
        "bn" => record
            .batch_norm
            .as_deref()
            .and_then(|bn| bn.chars().next())
            .map(String::from)
            .unwrap_or_default(),
        "optim_str" => record.optim_str.clone(),
        "coder_dict" => opt(record.coder_dict.as_ref()),
        "forced_var" => opt(record.forced_var.as_ref()),
        "L" => record.latent_sampling.to_string(),
        "sigma_train" => format!("{:?}", record.sigma_train).to_lowercase(),
        "sigma" => opt(record.sigma.as_ref()),
        "beta" => record.beta.to_string(),
        "gamma" => record.gamma.to_string(),
        "job" => record.job.to_string(),
        _ => String::new(),
    }
}

fn measure_names(level: MeasureLevel) -> Vec<&'static str> {
    match level {
        MeasureLevel::None => Vec::new(),
        MeasureLevel::Basic => vec!["epoch", "done"],
        MeasureLevel::Full => vec![
            "epoch",
            "done",
            "dict_var",
            "beta_sigma",
            "rmse",
            "train_loss",
            "test_loss",
            "train_zdist",
            "test_zdist",
        ],
    }
}

fn measure_value(record: &ModelRecord, name: &str) -> Option<f64> {
    match name {
        "epoch" => Some(record.epoch as f64),
        "done" => Some(record.done as f64),
        "dict_var" => Some(record.dict_var),
        "beta_sigma" => record.beta_sigma,
        "rmse" => record.rmse,
        "train_loss" => record.train_loss,
        "test_loss" => record.test_loss,
        "train_zdist" => record.train_zdist,
        "test_zdist" => record.test_zdist,
        _ => None,
    }
}

fn tpr_label(tpr: f64) -> String {
    tpr.to_string()
}

/// One table per training set label found among `records`.
#[must_use]
pub fn results_tables(records: &[ModelRecord], options: &ReportOptions) -> BTreeMap<String, ResultTable> {
    let datasets: BTreeSet<&str> = records.iter().map(|r| r.set.as_str()).collect();
    datasets
        .into_iter()
        .map(|dataset| (dataset.to_string(), results_table(records, dataset, options)))
        .collect()
}

#[must_use]
pub fn results_table(records: &[ModelRecord], dataset: &str, options: &ReportOptions) -> ResultTable {
    let rows: Vec<&ModelRecord> = records.iter().filter(|r| r.set == dataset).collect();
    let index_names = index_names(dataset);

    let mut columns: Vec<ColumnKey> = Vec::new();

    let predict: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.accuracies.keys().map(String::as_str))
        .filter(|m| options.predict_methods.shows(m))
        .collect();
    columns.extend(predict.iter().map(|m| ColumnKey::new(dataset, m, RATE_METRIC)));

    let tested_sets: BTreeSet<&str> = rows
        .iter()
        .flat_map(|r| r.ood_fprs.keys().map(String::as_str))
        .collect();
    let shown_sets: Vec<&str> = match options.ood_sets.get(dataset) {
        Some(wanted) => wanted
            .iter()
            .map(String::as_str)
            .filter(|s| tested_sets.contains(s))
            .collect(),
        None => tested_sets.into_iter().collect(),
    };
    let metrics: Vec<String> = options
        .tpr
        .iter()
        .map(|t| tpr_label(*t))
        .chain(std::iter::once(AUC_METRIC.to_string()))
        .collect();
    for set in &shown_sets {
        let methods: BTreeSet<&str> = rows
            .iter()
            .filter_map(|r| r.ood_fprs.get(*set))
            .flat_map(|by_method| by_method.keys().map(String::as_str))
            .filter(|m| options.ood_methods.shows(m))
            .collect();
        for method in methods {
            columns.extend(metrics.iter().map(|metric| ColumnKey::new(set, method, metric)));
        }
    }

    let measures = measure_names(options.show_measures);
    columns.extend(measures.iter().map(|m| ColumnKey::new(MEASURES_SET, "", m)));

    let mut table_rows: Vec<Row> = rows
        .iter()
        .map(|record| Row {
            index: index_names.iter().map(|n| index_value(record, n)).collect(),
            values: columns
                .iter()
                .map(|column| cell_value(record, dataset, column, options))
                .collect(),
        })
        .collect();

    let sort_keys = resolve_sort_keys(&options.sorting_keys, &index_names, &columns);
    if !sort_keys.is_empty() {
        table_rows.sort_by(|lhs, rhs| {
            sort_keys
                .iter()
                .map(|key| compare_rows(lhs, rhs, *key))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    ResultTable {
        dataset: dataset.to_string(),
        index_names,
        columns,
        rows: table_rows,
    }
}

fn cell_value(
    record: &ModelRecord,
    dataset: &str,
    column: &ColumnKey,
    options: &ReportOptions,
) -> Option<f64> {
    if column.set == MEASURES_SET {
        return measure_value(record, &column.metric);
    }
    if column.set == dataset && column.metric == RATE_METRIC {
        return record.accuracies.get(&column.method).map(|a| 100.0 * a);
    }
    let summary = record.ood_fprs.get(&column.set)?.get(&column.method)?;
    if column.metric == AUC_METRIC {
        return summary.auc.map(|auc| 100.0 * auc);
    }
    let tpr = options
        .tpr
        .iter()
        .copied()
        .find(|t| tpr_label(*t) == column.metric)?;
    let fpr = summary.fpr_at(tpr)?;
    Some(100.0 * if options.tnr { 1.0 - fpr } else { fpr })
}

#[derive(Debug, Clone, Copy)]
enum SortKey {
    Index(usize),
    Column(usize),
}

fn resolve_sort_keys(keys: &[String], index_names: &[String], columns: &[ColumnKey]) -> Vec<SortKey> {
    keys.iter()
        .filter_map(|key| {
            if let Some(i) = index_names.iter().position(|n| n == key) {
                return Some(SortKey::Index(i));
            }
            if let Some(i) = columns.iter().position(|c| &c.label() == key) {
                return Some(SortKey::Column(i));
            }
            log::error!(
                "key {key} not used for sorting; index keys: {}",
                index_names.join(", ")
            );
            None
        })
        .collect()
}

fn compare_rows(lhs: &Row, rhs: &Row, key: SortKey) -> Ordering {
    match key {
        SortKey::Index(i) => {
            let (a, b) = (&lhs.index[i], &rhs.index[i]);
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => x.total_cmp(&y),
                _ => a.cmp(b),
            }
        }
        SortKey::Column(i) => match (lhs.values[i], rhs.values[i]) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use cv_data::{DatasetRegistry, DatasetSpec};
    use cv_model::{
        MethodSpec, ModelSnapshot, RocEntry, SnapshotFile, TestEntry, TrainHistory, WantedEpoch,
    };
    use cv_results::ModelRecord;

    use super::{
        ColumnKey, MeasureLevel, MethodDisplay, ReportOptions, ResultTable, Row, results_tables,
    };

    fn registry() -> DatasetRegistry {
        let mut registry = DatasetRegistry::new();
        for name in ["digits", "glyphs"] {
            registry.insert(
                name,
                DatasetSpec {
                    shape: vec![1, 8, 8],
                    classes: Some(vec!["a".to_string(), "b".to_string()]),
                },
            );
        }
        registry
    }

    fn record(job: u64, set: &str, accuracy: f64, fpr: f64) -> ModelRecord {
        let mut meta = SnapshotFile::default();
        meta.job_number = job;
        meta.architecture.kind = "cvae".to_string();
        meta.training.set = set.to_string();
        meta.training.epochs = 10;
        meta.predict_methods = vec![MethodSpec::parse("iws").expect("method")];
        meta.ood_methods = vec![MethodSpec::parse("kl").expect("method")];

        let mut tests = BTreeMap::new();
        tests.insert(
            "iws".to_string(),
            TestEntry {
                n: 1000,
                epochs: 10,
                accuracy,
                ..TestEntry::default()
            },
        );
        let mut by_set = BTreeMap::new();
        let mut by_method = BTreeMap::new();
        by_method.insert(
            "kl".to_string(),
            RocEntry {
                n: 1000,
                epochs: 10,
                fpr: vec![fpr / 2.0, fpr],
                tpr: vec![0.9, 0.95],
                auc: Some(0.9),
                thresholds: vec![2.0, 1.0],
            },
        );
        let other = if set == "digits" { "glyphs" } else { "digits" };
        by_set.insert(other.to_string(), by_method);

        let snapshot = ModelSnapshot {
            dir: PathBuf::from(format!("/jobs/{job:06}")),
            meta,
            testing: [(10, tests)].into_iter().collect(),
            ood_results: [(10, by_set)].into_iter().collect(),
            history: TrainHistory {
                epochs: 10,
                ..TrainHistory::default()
            },
        };
        ModelRecord::from_snapshot(&snapshot, &registry(), 0.95, WantedEpoch::Last)
    }

    #[test]
    fn one_table_per_training_set_with_percent_values() {
        let records = vec![
            record(1, "digits", 0.9, 0.2),
            record(2, "digits", 0.8, 0.1),
            record(3, "glyphs", 0.7, 0.3),
        ];
        let tables = results_tables(&records, &ReportOptions::default());
        assert_eq!(tables.keys().collect::<Vec<_>>(), vec!["digits", "glyphs"]);

        let digits = &tables["digits"];
        assert_eq!(digits.rows.len(), 2);
        assert!(!digits.index_names.contains(&"h/o".to_string()));
        let rate = digits.value(0, "digits", "first", "rate").expect("accuracy");
        assert!((rate - 90.0).abs() < 1e-9);
        let fpr = digits.value(0, "glyphs", "first", "0.95").expect("fpr");
        assert!((fpr - 20.0).abs() < 1e-9);
        assert_eq!(digits.value(1, "measures", "", "done"), Some(10.0));
        assert!(digits.column("digits", "iws", "rate").is_none());
    }

    #[test]
    fn all_methods_tnr_and_sorting() {
        let records = vec![record(1, "digits", 0.9, 0.2), record(2, "digits", 0.8, 0.1)];
        let options = ReportOptions {
            predict_methods: MethodDisplay::All,
            ood_methods: MethodDisplay::All,
            show_measures: MeasureLevel::None,
            tnr: true,
            sorting_keys: vec!["glyphs:kl:0.95".to_string(), "nonsense".to_string()],
            ..ReportOptions::default()
        };
        let tables = results_tables(&records, &options);
        let digits = &tables["digits"];
        assert!(digits.column("digits", "first", "rate").is_none());
        assert!(digits.column("digits", "iws", "rate").is_some());
        assert!(digits.columns.iter().all(|c| c.set != "measures"));

        // tnr ascending: job 1 (80%) before job 2 (90%).
        let job = digits
            .index_names
            .iter()
            .position(|n| n == "job")
            .expect("job index");
        assert_eq!(digits.rows[0].index[job], "1");
        let tnr = digits.value(0, "glyphs", "kl", "0.95").expect("tnr");
        assert!((tnr - 80.0).abs() < 1e-9);
    }

    #[test]
    fn text_and_csv_rendering() {
        let records = vec![record(7, "digits", 0.5, 0.25)];
        let table = &results_tables(&records, &ReportOptions::default())["digits"];

        let text = table.to_text();
        assert_eq!(text.lines().count(), 4);
        assert!(text.contains("50.0"));
        assert!(text.contains("25.0"));

        let csv = table.to_csv().expect("csv output");
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("type,depth,features,arch_code,K"));
        assert!(lines[3].ends_with(",10,10"));
    }

    #[test]
    fn csv_cells_with_separators_survive_a_read_back() {
        let table = ResultTable {
            dataset: "digits".to_string(),
            index_names: vec!["options".to_string()],
            columns: vec![ColumnKey::new("digits", "iws", "rate")],
            rows: vec![
                Row {
                    index: vec!["p:fu, t:d".to_string()],
                    values: vec![Some(87.5)],
                },
                Row {
                    index: vec!["c:\r\"x\"".to_string()],
                    values: vec![None],
                },
            ],
        };
        let csv = table.to_csv().expect("csv output");
        let records: Vec<Vec<String>> = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(csv.as_bytes())
            .records()
            .map(|record| {
                record
                    .expect("record should parse")
                    .iter()
                    .map(str::to_string)
                    .collect()
            })
            .collect();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], vec!["", "digits"]);
        assert_eq!(records[2], vec!["options", "rate"]);
        assert_eq!(records[3], vec!["p:fu, t:d", "87.5"]);
        assert_eq!(records[4], vec!["c:\r\"x\"", ""]);
    }
}
