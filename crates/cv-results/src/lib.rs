#![forbid(unsafe_code)]

//! Reconciliation of evaluation results across their three sources, and
//! flat per-model summaries for reporting.
//!
//! Sample counts for a (dataset, method combination) can come from the JSON
//! result caches of a snapshot, from recorder files under `samples/NNNN/`, or
//! from evaluating the model now. Sources are ranked
//! compute > recorders > json; each one's gain is what it adds over the
//! sources ranked below it, counted only above a per-dataset threshold.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use cv_data::DatasetRegistry;
use cv_model::{
    MethodSelection, MethodSpec, ModelSnapshot, RocEntry, TestEntry, WantedEpoch, last_samples,
    required_channels, sample_epochs,
};
use cv_record::{load_all, record_paths};
use cv_runtime::{EvidenceKind, EvidenceLedger};
use cv_serialize::{DecodeMode, det64_hex};
use serde::Serialize;
use serde_json::Value;

const ROTATED_SUFFIX: &str = "90";
const AVERAGE_SET: &str = "average";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Compute,
    Recorders,
    Json,
}

impl Source {
    /// Highest priority first.
    pub const PRIORITY: [Self; 3] = [Self::Compute, Self::Recorders, Self::Json];

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Recorders => "recorders",
            Self::Json => "json",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|source| source.label() == raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityQuery {
    /// Defaults to the model's training set.
    pub testset: Option<String>,
    /// Defaults to every set with the test set's input shape.
    pub oodsets: Option<Vec<String>>,
    pub predict_methods: MethodSelection,
    pub ood_methods: MethodSelection,
    pub misclass_methods: MethodSelection,
    pub wanted_epoch: WantedEpoch,
    pub epoch_tolerance: usize,
    pub min_samples_by_class: usize,
    pub samples_available_by_class: usize,
    pub sources: BTreeSet<Source>,
    pub decode_mode: DecodeMode,
}

impl Default for AvailabilityQuery {
    fn default() -> Self {
        Self {
            testset: None,
            oodsets: None,
            predict_methods: MethodSelection::All,
            ood_methods: MethodSelection::All,
            misclass_methods: MethodSelection::All,
            wanted_epoch: WantedEpoch::Last,
            epoch_tolerance: 5,
            min_samples_by_class: 200,
            samples_available_by_class: 800,
            sources: Source::PRIORITY.into_iter().collect(),
            decode_mode: DecodeMode::Strict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SetAvailability {
    pub min_samples: usize,
    pub counts: BTreeMap<Source, BTreeMap<String, usize>>,
    pub gains: BTreeMap<Source, usize>,
}

impl SetAvailability {
    #[must_use]
    pub fn count(&self, source: Source, method: &str) -> usize {
        self.counts
            .get(&source)
            .and_then(|by_method| by_method.get(method))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn gain(&self, source: Source) -> usize {
        self.gains.get(&source).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SourceTotals {
    pub by_source: BTreeMap<Source, usize>,
    pub anywhere: usize,
}

impl SourceTotals {
    #[must_use]
    pub fn total(&self, source: Source) -> usize {
        self.by_source.get(&source).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EpochAvailability {
    pub sets: BTreeMap<String, SetAvailability>,
    /// Recorder directory that provided at least one count.
    pub rec_dir: Option<PathBuf>,
    pub all_sets: SourceTotals,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct AvailabilityTable {
    pub wanted_epoch: Option<usize>,
    pub testset: String,
    pub epochs: BTreeMap<usize, EpochAvailability>,
}

impl AvailabilityTable {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    #[must_use]
    pub fn epoch(&self, epoch: usize) -> Option<&EpochAvailability> {
        self.epochs.get(&epoch)
    }
}

/// Gain of each source given its count, `counts` being in priority order.
/// A source keeps its excess over the best source ranked below it, and only
/// when that excess is above `threshold`.
#[must_use]
pub fn marginal_gains(counts: &[usize], threshold: usize) -> Vec<usize> {
    counts
        .iter()
        .enumerate()
        .map(|(i, own)| {
            let below = counts[i + 1..].iter().copied().max().unwrap_or(0);
            let excess = own.saturating_sub(below);
            if excess > threshold { excess } else { 0 }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Predict,
    Misclass,
    Ood,
}

#[derive(Debug, Clone)]
struct Combo {
    key: String,
    role: Role,
    members: Vec<String>,
    channels: BTreeSet<&'static str>,
}

impl Combo {
    fn new(role: Role, members: Vec<String>) -> Self {
        Self {
            key: members.join("-"),
            channels: required_channels(members.iter().map(String::as_str)),
            role,
            members,
        }
    }
}

#[derive(Debug, Clone)]
struct SetPlan {
    name: String,
    classes: usize,
    combos: Vec<Combo>,
}

/// What can be counted, where, for the epochs around the wanted one.
///
/// A model with nothing tested asked for its last epoch yields an empty
/// table. Unreadable recorder files count as zero and are recorded in the
/// ledger.
pub fn available_results(
    model: &ModelSnapshot,
    registry: &DatasetRegistry,
    query: &AvailabilityQuery,
    ledger: &mut EvidenceLedger,
) -> AvailabilityTable {
    let testset = query
        .testset
        .clone()
        .unwrap_or_else(|| model.training_set().to_string());
    let Some(wanted) = model.resolve_epoch(query.wanted_epoch) else {
        ledger.record(
            EvidenceKind::Reconcile,
            format!(
                "{} has no tested epoch, availability is empty",
                model.dir.display()
            ),
        );
        return AvailabilityTable {
            wanted_epoch: None,
            testset,
            epochs: BTreeMap::new(),
        };
    };

    let plans = plan_sets(model, registry, query, &testset);
    let tolerance = query.epoch_tolerance;
    let trained = model.meta.trained;
    let sample_dirs = sample_epochs(&model.samples_dir());

    let mut epochs: BTreeSet<usize> = sample_dirs.keys().copied().collect();
    epochs.insert(trained);
    epochs.extend(model.testing.keys().copied());
    epochs.extend(model.ood_results.keys().copied());
    epochs.retain(|epoch| epoch.abs_diff(wanted) <= tolerance);

    let participating: Vec<Source> = Source::PRIORITY
        .into_iter()
        .filter(|source| query.sources.contains(source))
        .collect();

    let mut table = AvailabilityTable {
        wanted_epoch: Some(wanted),
        testset: testset.clone(),
        epochs: BTreeMap::new(),
    };

    for epoch in epochs {
        let mut availability = EpochAvailability::default();
        for plan in &plans {
            let mut set = SetAvailability {
                min_samples: plan.classes * query.min_samples_by_class,
                ..SetAvailability::default()
            };
            for source in Source::PRIORITY {
                set.counts.insert(
                    source,
                    plan.combos.iter().map(|c| (c.key.clone(), 0)).collect(),
                );
            }
            let json = json_counts(model, epoch, plan.name == testset, &plan.name, &plan.combos);
            set.counts.insert(Source::Json, json);
            availability.sets.insert(plan.name.clone(), set);
        }

        if let Some(rec_dir) = sample_dirs.get(&epoch) {
            count_recorders(rec_dir, &plans, query.decode_mode, &mut availability, ledger);
        }

        if wanted.abs_diff(trained) <= tolerance && epoch == trained {
            for plan in &plans {
                let computable = plan.classes * query.samples_available_by_class;
                if let Some(counts) = availability
                    .sets
                    .get_mut(&plan.name)
                    .and_then(|set| set.counts.get_mut(&Source::Compute))
                {
                    for count in counts.values_mut() {
                        *count = computable;
                    }
                }
            }
        }

        for set in availability.sets.values_mut() {
            let keys: Vec<String> = set
                .counts
                .get(&Source::Json)
                .map(|counts| counts.keys().cloned().collect())
                .unwrap_or_default();
            let mut gains: BTreeMap<Source, usize> =
                Source::PRIORITY.into_iter().map(|s| (s, 0)).collect();
            for key in &keys {
                let column: Vec<usize> = participating
                    .iter()
                    .map(|source| set.count(*source, key))
                    .collect();
                for (source, gain) in participating
                    .iter()
                    .zip(marginal_gains(&column, set.min_samples))
                {
                    *gains.entry(*source).or_insert(0) += gain;
                }
            }
            set.gains = gains;
        }

        let mut totals = SourceTotals::default();
        for source in Source::PRIORITY {
            let total = availability.sets.values().map(|set| set.gain(source)).sum();
            totals.by_source.insert(source, total);
            totals.anywhere += total;
        }
        availability.all_sets = totals;
        table.epochs.insert(epoch, availability);
    }

    ledger.record(
        EvidenceKind::Reconcile,
        format!(
            "availability for {} around epoch {wanted}: {} epochs, {} sets",
            model.dir.display(),
            table.epochs.len(),
            plans.len()
        ),
    );
    table
}

fn plan_sets(
    model: &ModelSnapshot,
    registry: &DatasetRegistry,
    query: &AvailabilityQuery,
    testset: &str,
) -> Vec<SetPlan> {
    let families = &model.meta.families;
    let predict = query
        .predict_methods
        .resolve(&model.meta.predict_methods, families);
    let ood = query.ood_methods.resolve(&model.meta.ood_methods, families);
    let misclass = query
        .misclass_methods
        .resolve(&model.meta.misclass_methods, families);

    let mut names = vec![testset.to_string()];
    if !ood.is_empty() {
        let oodsets = query
            .oodsets
            .clone()
            .unwrap_or_else(|| registry.same_size(testset));
        for set in oodsets {
            if !names.contains(&set) {
                names.push(set);
            }
        }
    }

    let ood_combos: Vec<Combo> = ood
        .iter()
        .map(|m| Combo::new(Role::Ood, vec![m.clone()]))
        .collect();

    names
        .into_iter()
        .map(|name| {
            let mut combos = Vec::new();
            if name == testset {
                combos.extend(
                    predict
                        .iter()
                        .map(|m| Combo::new(Role::Predict, vec![m.clone()])),
                );
                for mm in &misclass {
                    for pm in &predict {
                        combos.push(Combo::new(Role::Misclass, vec![pm.clone(), mm.clone()]));
                    }
                }
            }
            combos.extend(ood_combos.iter().cloned());
            let mut seen = BTreeSet::new();
            combos.retain(|combo| seen.insert(combo.key.clone()));

            let classes = registry
                .labels(&name)
                .filter(|labels| *labels > 0)
                .unwrap_or(model.meta.num_labels);
            SetPlan {
                name,
                classes,
                combos,
            }
        })
        .collect()
}

fn json_counts(
    model: &ModelSnapshot,
    epoch: usize,
    is_testset: bool,
    set: &str,
    combos: &[Combo],
) -> BTreeMap<String, usize> {
    let tests = if is_testset {
        model.testing.get(&epoch)
    } else {
        None
    };
    let oods = model.ood_results.get(&epoch).and_then(|by_set| by_set.get(set));

    combos
        .iter()
        .map(|combo| {
            let n = match (combo.role, combo.members.as_slice()) {
                (Role::Predict, [pm]) => tests.and_then(|t| t.get(pm)).map(|e| e.n),
                (Role::Misclass, [pm, mm]) => tests
                    .and_then(|t| t.get(pm))
                    .and_then(|e| e.misclass.get(mm))
                    .map(|e| e.n),
                (Role::Ood, [m]) => oods.and_then(|o| o.get(m)).map(|e| e.n),
                _ => None,
            };
            (combo.key.clone(), n.unwrap_or(0))
        })
        .collect()
}

fn count_recorders(
    rec_dir: &std::path::Path,
    plans: &[SetPlan],
    mode: DecodeMode,
    availability: &mut EpochAvailability,
    ledger: &mut EvidenceLedger,
) {
    let scan = match load_all(rec_dir, mode, ledger) {
        Ok(scan) => scan,
        Err(error) => {
            ledger.warn(
                EvidenceKind::Durability,
                format!("recorders unavailable: {error}"),
            );
            return;
        }
    };
    for plan in plans {
        let Some(recorder) = scan.recorders.get(&plan.name) else {
            continue;
        };
        let n = recorder.recorded_samples();
        let Some(counts) = availability
            .sets
            .get_mut(&plan.name)
            .and_then(|set| set.counts.get_mut(&Source::Recorders))
        else {
            continue;
        };
        for combo in &plan.combos {
            if combo.channels.iter().all(|c| recorder.has_channel(c)) {
                counts.insert(combo.key.clone(), n);
                availability.rec_dir = Some(rec_dir.to_path_buf());
            }
        }
    }
}

/// Keeps only `methods`, filling the missing ones with empty entries.
#[must_use]
pub fn clean_results<T: Clone + Default>(
    results: &BTreeMap<String, T>,
    methods: &[String],
) -> BTreeMap<String, T> {
    methods
        .iter()
        .map(|m| (m.clone(), results.get(m).cloned().unwrap_or_default()))
        .collect()
}

/// Lowest false positive rate reached at a true positive rate of at least
/// `tpr`.
#[must_use]
pub fn fpr_at_tpr(fpr: &[f64], tpr: &[f64], target: f64) -> Option<f64> {
    fpr.iter()
        .zip(tpr)
        .filter(|(_, t)| **t >= target)
        .map(|(f, _)| *f)
        .reduce(f64::min)
}

/// Mean over the non-rotated OOD sets of the methods they all share. AUC and
/// FPR are averaged, `n` and `epochs` take the minimum, TPR and thresholds
/// come from the first set.
#[must_use]
pub fn average_ood_results(
    by_set: &BTreeMap<String, BTreeMap<String, RocEntry>>,
) -> Option<BTreeMap<String, RocEntry>> {
    let sets: Vec<&BTreeMap<String, RocEntry>> = by_set
        .iter()
        .filter(|(name, _)| !name.ends_with(ROTATED_SUFFIX))
        .map(|(_, results)| results)
        .collect();
    let first = sets.first()?;
    let shared: Vec<&String> = first
        .keys()
        .filter(|m| sets.iter().all(|results| results.contains_key(*m)))
        .collect();
    if shared.is_empty() {
        return None;
    }

    let mut average = BTreeMap::new();
    for method in shared {
        let entries: Vec<&RocEntry> = sets.iter().filter_map(|r| r.get(method)).collect();
        let aucs: Vec<f64> = entries.iter().filter_map(|e| e.auc).collect();
        let auc = (!aucs.is_empty()).then(|| aucs.iter().sum::<f64>() / aucs.len() as f64);
        let points = entries.iter().map(|e| e.fpr.len()).min().unwrap_or(0);
        let fpr = (0..points)
            .map(|i| entries.iter().map(|e| e.fpr[i]).sum::<f64>() / entries.len() as f64)
            .collect();
        let reference = entries.first().copied().cloned().unwrap_or_default();
        average.insert(
            method.clone(),
            RocEntry {
                n: entries.iter().map(|e| e.n).min().unwrap_or(0),
                epochs: entries.iter().map(|e| e.epochs).min().unwrap_or(0),
                fpr,
                tpr: reference.tpr,
                auc,
                thresholds: reference.thresholds,
            },
        );
    }
    Some(average)
}

/// One method's ROC on one set, as `(tpr, fpr)` points.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct RocSummary {
    pub points: Vec<(f64, f64)>,
    pub auc: Option<f64>,
    /// Family member picked for a starred method.
    pub params: Option<String>,
}

impl RocSummary {
    #[must_use]
    pub fn from_entry(entry: &RocEntry) -> Self {
        Self {
            points: entry.tpr.iter().copied().zip(entry.fpr.iter().copied()).collect(),
            auc: entry.auc,
            params: None,
        }
    }

    #[must_use]
    pub fn fpr_at(&self, tpr: f64) -> Option<f64> {
        self.points
            .iter()
            .find(|(t, _)| (t - tpr).abs() < 1e-9)
            .map(|(_, f)| *f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SigmaTraining {
    Learned,
    Coded,
    Rmse,
    Decay,
    Constant,
}

/// Flat summary of one model, the row material of result tables and the
/// source of registry cache attributes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRecord {
    pub job: u64,
    pub is_resumed: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub arch: String,
    pub arch_code: String,
    pub dict_var: f64,
    pub coder_dict: Option<String>,
    pub forced_var: Option<f64>,
    pub features: String,
    pub dir: PathBuf,
    pub heldout: Vec<usize>,
    #[serde(rename = "h/o")]
    pub heldout_label: String,
    pub set: String,
    pub data_augmentation: Vec<String>,
    pub train_batch_size: usize,
    pub sigma: Option<f64>,
    pub beta_sigma: Option<f64>,
    pub sigma_train: SigmaTraining,
    pub sigma_size: String,
    pub beta: f64,
    pub gamma: f64,
    pub done: usize,
    pub epochs: usize,
    pub has_validation: bool,
    pub trained: f64,
    pub finished: bool,
    pub n_tested: usize,
    pub epoch: usize,
    pub accuracies: BTreeMap<String, f64>,
    pub best_accuracy: Option<f64>,
    pub n_ood: BTreeMap<String, usize>,
    pub epochs_ood: BTreeMap<String, usize>,
    pub ood_fprs: BTreeMap<String, BTreeMap<String, RocSummary>>,
    pub ood_fpr: BTreeMap<String, Option<RocSummary>>,
    pub best_method: BTreeMap<String, Option<String>>,
    pub recorders: BTreeMap<String, PathBuf>,
    pub recorded_epoch: Option<usize>,
    pub rmse: Option<f64>,
    pub test_loss: Option<f64>,
    pub train_loss: Option<f64>,
    pub test_zdist: Option<f64>,
    pub train_zdist: Option<f64>,
    #[serde(rename = "K")]
    pub latent_dim: usize,
    #[serde(rename = "L")]
    pub latent_sampling: usize,
    pub warmup: usize,
    pub pretrained_features: Option<String>,
    pub pretrained_upsampler: Option<String>,
    pub batch_norm: Option<String>,
    pub depth: usize,
    pub width: usize,
    pub options: String,
    pub optim_str: String,
    pub optim: String,
    pub lr: f64,
}

impl ModelRecord {
    pub fn from_snapshot(
        model: &ModelSnapshot,
        registry: &DatasetRegistry,
        tpr: f64,
        wanted: WantedEpoch,
    ) -> Self {
        let meta = &model.meta;
        let architecture = &meta.architecture;
        let training = &meta.training;
        log::debug!("summarizing model in {}", model.dir.display());

        let arch = architecture.describe(false);
        let arch_code: String = det64_hex(arch.as_bytes())
            .trim_start_matches("det64:")
            .chars()
            .take(6)
            .collect();

        let wanted_epoch = model.resolve_epoch(wanted);
        let tested = wanted_epoch.and_then(|epoch| model.testing.get(&epoch));
        let predict = model.predict_methods();
        let empty_tests = BTreeMap::new();
        let testing: BTreeMap<String, TestEntry> =
            clean_results(tested.unwrap_or(&empty_tests), &predict);

        let mut accuracies: BTreeMap<String, f64> = testing
            .iter()
            .map(|(m, entry)| (m.clone(), entry.accuracy))
            .collect();
        let (best_accuracy, tested_epoch, n_tested) =
            match (tested.filter(|t| !t.is_empty()), predict.first()) {
                (Some(_), Some(first)) => {
                    if let Some(accuracy) = accuracies.get(first).copied() {
                        accuracies.insert("first".to_string(), accuracy);
                    }
                    (
                        testing.values().map(|e| e.accuracy).reduce(f64::max),
                        testing.values().map(|e| e.epochs).min().unwrap_or(0),
                        testing.values().map(|e| e.n).min().unwrap_or(0),
                    )
                }
                _ => (None, 0, 0),
            };

        let training_set = model.training_set();
        let mut ood_results = wanted_epoch
            .and_then(|epoch| model.ood_results.get(&epoch))
            .cloned()
            .unwrap_or_default();
        ood_results.remove(training_set);

        let heldout = match registry.heldout_classes(training_set) {
            Ok(heldout) => heldout,
            Err(error) => {
                log::warn!("{error}");
                cv_data::HeldOut {
                    parent: training_set.to_string(),
                    classes: Vec::new(),
                }
            }
        };
        let parent = heldout.parent.clone();
        let mut all_ood_sets = if heldout.classes.is_empty() {
            registry.same_size(training_set)
        } else {
            let complement = format!("{parent}+?");
            let matching = ood_results
                .keys()
                .find(|name| name.starts_with(parent.as_str()))
                .cloned();
            if let Some(matching) = matching
                && let Some(results) = ood_results.remove(&matching)
            {
                ood_results.insert(complement.clone(), results);
            }
            vec![complement]
        };
        if let Some(average) = average_ood_results(&ood_results) {
            ood_results.insert(AVERAGE_SET.to_string(), average);
        }
        all_ood_sets.push(AVERAGE_SET.to_string());

        let mut ood_fprs: BTreeMap<String, BTreeMap<String, RocSummary>> = BTreeMap::new();
        let mut ood_fpr = BTreeMap::new();
        let mut best_method = BTreeMap::new();
        let mut n_ood = BTreeMap::new();
        let mut epochs_ood = BTreeMap::new();
        for set in &all_ood_sets {
            ood_fprs.insert(set.clone(), BTreeMap::new());
            ood_fpr.insert(set.clone(), None);
            best_method.insert(set.clone(), None);
            n_ood.insert(set.clone(), 0);
            epochs_ood.insert(set.clone(), 0);
        }

        let listed: Vec<String> = meta.ood_methods.iter().map(MethodSpec::to_string).collect();
        for (set, results) in ood_results.iter().filter(|(s, _)| all_ood_sets.contains(s)) {
            let mut by_method: BTreeMap<String, RocSummary> = BTreeMap::new();
            let mut best: Option<(f64, String)> = None;
            let mut n_min = usize::MAX;
            let mut epochs_min = usize::MAX;

            for spec in &meta.ood_methods {
                let (entry, params) = match spec {
                    MethodSpec::Single(method) => {
                        (results.get(method.name()).cloned().unwrap_or_default(), None)
                    }
                    MethodSpec::Family(family) => {
                        pick_family_member(results, meta.families.get(family), tpr)
                    }
                };
                let name = spec.to_string();
                if let Some(auc) = entry.auc
                    && best.as_ref().is_none_or(|(best_auc, _)| auc > *best_auc)
                {
                    best = Some((auc, name.clone()));
                }
                n_min = n_min.min(entry.n);
                epochs_min = epochs_min.min(entry.epochs);
                let mut summary = RocSummary::from_entry(&entry);
                summary.params = params;
                by_method.insert(name, summary);
            }
            if let Some(first) = listed.first().and_then(|m| by_method.get(m)).cloned() {
                by_method.insert("first".to_string(), first);
            }
            if let Some((_, method)) = &best {
                ood_fpr.insert(set.clone(), by_method.get(method).cloned());
            }
            best_method.insert(set.clone(), best.map(|(_, method)| method));
            if !listed.is_empty() {
                n_ood.insert(set.clone(), n_min);
                epochs_ood.insert(set.clone(), epochs_min);
            }
            ood_fprs.insert(set.clone(), by_method);
        }

        let history = &model.history;
        let rmse = history
            .test_measures
            .last()
            .and_then(|measures| measures.get("mse"))
            .map(|mse| mse.sqrt());
        fn last_loss(losses: &[BTreeMap<String, f64>], key: &str) -> Option<f64> {
            losses.last().and_then(|loss| loss.get(key)).copied()
        }

        let sigma = &meta.sigma;
        let sqrt_beta = training.beta.sqrt();
        let (sigma_train, beta_sigma) = if sigma.learned && !sigma.coded {
            (SigmaTraining::Learned, Some(sigma.value * sqrt_beta))
        } else if sigma.coded {
            (SigmaTraining::Coded, Some(sigma.value * sqrt_beta))
        } else if sigma.is_rmse {
            (SigmaTraining::Rmse, rmse.map(|r| r * sqrt_beta))
        } else if sigma.decay != 0.0 {
            (SigmaTraining::Decay, rmse.map(|r| r * sqrt_beta))
        } else {
            (SigmaTraining::Constant, Some(sigma.value))
        };

        let (coder_dict, dict_var) = if architecture.kind == "cvae" {
            let learned = training.coder_means.as_deref() == Some("learned");
            let measured = history
                .train_measures
                .last()
                .and_then(|measures| measures.get("ld-norm"))
                .copied();
            let dict_var = match measured {
                Some(norm) if learned => norm,
                _ => training.dictionary_variance,
            };
            (training.coder_means.clone(), dict_var)
        } else {
            (None, 0.0)
        };

        let recorded_epoch = last_samples(&model.dir);
        let recorders = recorded_epoch
            .and_then(|epoch| record_paths(&model.sample_epoch_dir(epoch)).ok())
            .unwrap_or_default();

        let heldout_classes = heldout.classes;
        let done = history.epochs;
        let target = training.epochs;

        Self {
            job: meta.job_number,
            is_resumed: meta.is_resumed,
            kind: architecture.kind.clone(),
            arch,
            arch_code,
            dict_var,
            coder_dict,
            forced_var: architecture.encoder_forced_variance.filter(|v| *v != 0.0),
            features: architecture
                .features
                .clone()
                .unwrap_or_else(|| "none".to_string()),
            dir: model.dir.clone(),
            heldout_label: heldout_classes
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            set: if heldout_classes.is_empty() {
                parent
            } else {
                format!("{parent}-?")
            },
            heldout: heldout_classes,
            data_augmentation: training.data_augmentation.clone(),
            train_batch_size: training.batch_size.unwrap_or(training.max_train_batch_size),
            sigma: (sigma_train == SigmaTraining::Constant).then_some(sigma.value),
            beta_sigma,
            sigma_train,
            sigma_size: if sigma.sdim == 1 { "S" } else { "M" }.to_string(),
            beta: training.beta,
            gamma: training.gamma,
            done,
            epochs: target,
            has_validation: history.validation_loss.is_some(),
            trained: if target == 0 {
                0.0
            } else {
                done as f64 / target as f64
            },
            finished: done >= target,
            n_tested,
            epoch: tested_epoch,
            accuracies,
            best_accuracy,
            n_ood,
            epochs_ood,
            ood_fprs,
            ood_fpr,
            best_method,
            recorders,
            recorded_epoch,
            rmse,
            test_loss: last_loss(&history.test_loss, "total"),
            train_loss: last_loss(&history.train_loss, "total"),
            test_zdist: last_loss(&history.test_loss, "zdist").map(f64::sqrt),
            train_zdist: last_loss(&history.train_loss, "zdist").map(f64::sqrt),
            latent_dim: architecture.latent_dim,
            latent_sampling: training.latent_sampling,
            warmup: training.warmup,
            pretrained_features: architecture
                .features
                .as_ref()
                .and(training.pretrained_features.clone()),
            pretrained_upsampler: training.pretrained_upsampler.clone(),
            batch_norm: architecture.batch_norm.clone(),
            depth: architecture.depth(),
            width: architecture.width(),
            options: model.option_vector(),
            optim_str: training.optim.to_string(),
            optim: training.optim.kind.clone(),
            lr: training.optim.lr,
        }
    }

    /// Top-level fields as JSON values, keyed by their serialized names.
    #[must_use]
    pub fn attributes(&self) -> BTreeMap<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        }
    }
}

/// The member of a starred family with the lowest FPR at `tpr`, among those
/// with an AUC.
fn pick_family_member(
    results: &BTreeMap<String, RocEntry>,
    members: Option<&Vec<String>>,
    tpr: f64,
) -> (RocEntry, Option<String>) {
    let best = members
        .into_iter()
        .flatten()
        .filter_map(|member| {
            let entry = results.get(member)?;
            entry.auc?;
            Some((fpr_at_tpr(&entry.fpr, &entry.tpr, tpr)?, member))
        })
        .min_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0));
    match best {
        Some((_, member)) => (
            results.get(member).cloned().unwrap_or_default(),
            Some(member.clone()),
        ),
        None => (RocEntry::default(), None),
    }
}
