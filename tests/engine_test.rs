//! Integration tests for the stage processing engine.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, SystemTime};

use stagepipe::config::PipelineSettings;
use stagepipe::engine::{PROCESSING_MARKER, Pipeline, Stage, StageProcessor, claim, list_queued};
use stagepipe::error::{Error, Result};
use stagepipe::item_store;
use stagepipe::model::{Item, Metadata, PIPELINE_STAGE, REJECTION_REASON, StageInput, StageSpec, Verdict};
use tempfile::TempDir;

const INPUT: &str = "02_deduped";
const OUTPUT: &str = "03_categorized";
const REJECT: &str = "52_rejected_category";

fn settings(dir: &TempDir, max_retries: u32) -> PipelineSettings {
    PipelineSettings::new(
        dir.path().join("priority"),
        dir.path().join("main"),
        dir.path().join("logs"),
        dir.path().join("ALL_STOP"),
    )
    .max_retries(max_retries)
}

fn spec() -> StageSpec {
    StageSpec::new("categorize", INPUT, OUTPUT, REJECT)
}

/// Queue an item with `Item-ID: id` under `root/stage_dir`.
fn enqueue(root: &Path, stage_dir: &str, name: &str, id: Option<&str>) -> PathBuf {
    let dir = root.join(stage_dir);
    fs::create_dir_all(&dir).unwrap();
    let mut metadata = Metadata::new();
    if let Some(id) = id {
        metadata.insert("Item-ID", id);
    }
    metadata.insert("Title", "Why did the chicken cross the road");
    let path = dir.join(name);
    item_store::write(&path, &Item::new(metadata, "To get to the other side.")).unwrap();
    path
}

fn names_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

fn always_reject(calls: Arc<AtomicU32>, reason: &'static str) -> impl Stage {
    move |_input: StageInput| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, Error>(Verdict::reject(reason)) }
    }
}

fn advance_unchanged(input: StageInput) -> impl Future<Output = Result<Verdict>> + Send {
    async move {
        Ok(Verdict::Advance {
            metadata: input.metadata,
            body: input.body,
        })
    }
}

/// Stamps `Visited-<name>: yes` and advances.
struct Stamp(&'static str);

impl Stage for Stamp {
    async fn process(&self, input: StageInput) -> Result<Verdict> {
        let mut metadata = input.metadata;
        metadata.insert(format!("Visited-{}", self.0), "yes");
        Ok(Verdict::Advance {
            metadata,
            body: input.body,
        })
    }
}

// ---------------------------------------------------------------------------
// Retry and rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn always_failing_stage_is_called_max_retries_plus_one_then_rejected() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 2);
    let main = settings.main_root.clone();
    enqueue(&main, INPUT, "item-101", Some("101"));

    let calls = Arc::new(AtomicU32::new(0));
    let processor = StageProcessor::new(
        spec(),
        Arc::new(settings.clone()),
        always_reject(Arc::clone(&calls), "no category fits\nclosest was puns"),
    );
    let report = processor.run(&settings.roots()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.advanced, 0);
    assert!(report.is_clean());

    let rejected = item_store::parse(&main.join(REJECT).join("item-101")).unwrap();
    assert_eq!(rejected.metadata.get(PIPELINE_STAGE), Some(REJECT));
    assert_eq!(
        rejected.metadata.get(REJECTION_REASON),
        Some("no category fits closest was puns")
    );
    assert_eq!(rejected.body, "To get to the other side.");

    let log = fs::read_to_string(dir.path().join("logs").join("main_rejected_category.log")).unwrap();
    assert_eq!(log, "101 no category fits closest was puns\n");

    assert!(names_in(&main.join(INPUT)).iter().all(|n| n == "tmp"));
    assert!(names_in(&main.join(INPUT).join("tmp")).is_empty());
}

#[tokio::test]
async fn stage_errors_count_as_attempts() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 1);
    let main = settings.main_root.clone();
    enqueue(&main, INPUT, "item-7", Some("7"));

    let calls = Arc::new(AtomicU32::new(0));
    let stage = {
        let calls = Arc::clone(&calls);
        move |_input: StageInput| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<Verdict, _>(Error::stage("categorize", "endpoint returned 500")) }
        }
    };
    let processor = StageProcessor::new(spec(), Arc::new(settings.clone()), stage);
    let report = processor.run(&settings.roots()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.rejected, 1);
    let rejected = item_store::parse(&main.join(REJECT).join("item-7")).unwrap();
    assert!(
        rejected
            .metadata
            .get(REJECTION_REASON)
            .is_some_and(|r| r.contains("endpoint returned 500"))
    );
}

#[tokio::test]
async fn stage_succeeding_after_failures_advances_with_new_metadata() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 3);
    let main = settings.main_root.clone();
    enqueue(&main, INPUT, "item-55", Some("55"));

    let calls = Arc::new(AtomicU32::new(0));
    let stage = {
        let calls = Arc::clone(&calls);
        move |input: StageInput| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    return Ok(Verdict::reject(format!("attempt {n} unparseable")));
                }
                let mut metadata = input.metadata;
                metadata.insert("Category", "Animals");
                Ok::<_, Error>(Verdict::Advance {
                    metadata,
                    body: input.body,
                })
            }
        }
    };
    let processor = StageProcessor::new(spec(), Arc::new(settings.clone()), stage);
    let report = processor.run(&settings.roots()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.advanced, 1);
    assert_eq!(report.rejected, 0);

    let advanced = item_store::parse(&main.join(OUTPUT).join("item-55")).unwrap();
    assert_eq!(advanced.metadata.get("Category"), Some("Animals"));
    assert_eq!(advanced.metadata.get(PIPELINE_STAGE), Some(OUTPUT));
    assert_eq!(advanced.metadata.get("Item-ID"), Some("55"));
    assert_eq!(advanced.body, "To get to the other side.");
    assert!(!dir.path().join("logs").join("main_rejected_category.log").exists());
}

#[tokio::test]
async fn item_without_id_is_logged_by_file_name() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 0);
    enqueue(&settings.priority_root, INPUT, "anon.txt", None);

    let calls = Arc::new(AtomicU32::new(0));
    let processor = StageProcessor::new(
        spec(),
        Arc::new(settings.clone()),
        always_reject(Arc::clone(&calls), "empty"),
    );
    processor.run(&settings.roots()).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let log = fs::read_to_string(dir.path().join("logs").join("pri_rejected_category.log")).unwrap();
    assert_eq!(log, "anon.txt empty\n");
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_root_drains_before_main() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 0);
    enqueue(&settings.main_root, INPUT, "m1", Some("m1"));
    enqueue(&settings.priority_root, INPUT, "p1", Some("p1"));
    enqueue(&settings.main_root, INPUT, "m2", Some("m2"));
    enqueue(&settings.priority_root, INPUT, "p2", Some("p2"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let stage = {
        let seen = Arc::clone(&seen);
        move |input: StageInput| {
            seen.lock().unwrap().push(input.id.clone());
            advance_unchanged(input)
        }
    };
    let processor = StageProcessor::new(spec(), Arc::new(settings.clone()), stage);
    let report = processor.run(&settings.roots()).await;

    assert_eq!(report.advanced, 4);
    let seen = seen.lock().unwrap();
    let (first, second) = seen.split_at(2);
    assert!(first.iter().all(|id| id.starts_with('p')), "{seen:?}");
    assert!(second.iter().all(|id| id.starts_with('m')), "{seen:?}");
}

#[tokio::test]
async fn oldest_item_is_processed_first() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 0);
    let now = SystemTime::now();
    for (name, age_secs) in [("newest", 10), ("oldest", 300), ("middle", 60)] {
        let path = enqueue(&settings.main_root, INPUT, name, Some(name));
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(now - Duration::from_secs(age_secs))
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let stage = {
        let seen = Arc::clone(&seen);
        move |input: StageInput| {
            seen.lock().unwrap().push(input.id.clone());
            advance_unchanged(input)
        }
    };
    StageProcessor::new(spec(), Arc::new(settings.clone()), stage)
        .run(&settings.roots())
        .await;

    assert_eq!(*seen.lock().unwrap(), ["oldest", "middle", "newest"]);
}

// ---------------------------------------------------------------------------
// Claiming, markers and the stop flag
// ---------------------------------------------------------------------------

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    let dir = TempDir::new().unwrap();
    let source = enqueue(dir.path(), INPUT, "contested", Some("1"));
    let tmp = dir.path().join(INPUT).join("tmp");
    let start = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let source = source.clone();
            let tmp = tmp.clone();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                claim(&source, &tmp).is_ok()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();

    assert_eq!(winners, 1);
    assert!(!source.exists());
    assert!(tmp.join("contested").exists());
}

#[tokio::test]
async fn processing_marker_names_current_item_and_is_removed() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 1);
    enqueue(&settings.main_root, INPUT, "item-9", Some("9"));
    let marker = settings.main_root.join(INPUT).join("tmp").join(PROCESSING_MARKER);

    let observed = Arc::new(Mutex::new(Vec::new()));
    let stage = {
        let observed = Arc::clone(&observed);
        let marker = marker.clone();
        move |_input: StageInput| {
            observed
                .lock()
                .unwrap()
                .push(fs::read_to_string(&marker).unwrap_or_default());
            async { Ok::<_, Error>(Verdict::reject("still failing")) }
        }
    };
    StageProcessor::new(spec(), Arc::new(settings.clone()), stage)
        .run(&settings.roots())
        .await;

    assert_eq!(*observed.lock().unwrap(), ["9", "9"]);
    assert!(!marker.exists());
}

#[tokio::test]
async fn stop_flag_leaves_unclaimed_items_queued() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 0);
    for i in 0..5 {
        enqueue(&settings.main_root, INPUT, &format!("item-{i}"), Some(&i.to_string()));
    }

    let stop_flag = settings.stop_flag.clone();
    let stage = move |input: StageInput| {
        fs::write(&stop_flag, "").unwrap();
        advance_unchanged(input)
    };
    let report = StageProcessor::new(spec(), Arc::new(settings.clone()), stage)
        .run(&settings.roots())
        .await;

    assert!(report.stopped);
    assert_eq!(report.advanced, 1);
    assert_eq!(names_in(&settings.main_root.join(OUTPUT)).len(), 2); // item + tmp/
    let queued = list_queued(&settings.main_root.join(INPUT)).unwrap();
    assert_eq!(queued.len(), 4);
    for path in queued {
        let item = item_store::parse(&path).unwrap();
        assert!(!item.metadata.contains_key(PIPELINE_STAGE));
    }
    assert!(settings.stop_flag.exists());
}

#[tokio::test]
async fn stop_flag_present_before_run_touches_nothing() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 0);
    enqueue(&settings.main_root, INPUT, "item-1", Some("1"));
    fs::write(&settings.stop_flag, "").unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let report = StageProcessor::new(
        spec(),
        Arc::new(settings.clone()),
        always_reject(Arc::clone(&calls), "unused"),
    )
    .run(&settings.roots())
    .await;

    assert!(report.stopped);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(settings.main_root.join(INPUT).join("item-1").exists());
}

// ---------------------------------------------------------------------------
// Failure surfaces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn relocation_failure_leaves_item_claimed() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 0);
    enqueue(&settings.main_root, INPUT, "item-3", Some("3"));
    // A regular file where the output directory should be.
    fs::write(settings.main_root.join(OUTPUT), "not a directory").unwrap();

    let report = StageProcessor::new(spec(), Arc::new(settings.clone()), advance_unchanged)
        .run(&settings.roots())
        .await;

    assert_eq!(report.relocation_failures, 1);
    assert!(!report.is_clean());
    let tmp = settings.main_root.join(INPUT).join("tmp");
    assert_eq!(names_in(&tmp), ["item-3"]);
}

#[tokio::test]
async fn unclaimable_item_is_skipped_without_invoking_stage() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 3);
    enqueue(&settings.main_root, INPUT, "item-4", Some("4"));
    // A regular file where tmp/ should be makes the claim rename fail.
    fs::write(settings.main_root.join(INPUT).join("tmp"), "").unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let report = StageProcessor::new(
        spec(),
        Arc::new(settings.clone()),
        always_reject(Arc::clone(&calls), "unused"),
    )
    .run(&settings.roots())
    .await;

    assert_eq!(report.claim_failures, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(settings.main_root.join(INPUT).join("item-4").exists());
}

#[test]
fn list_queued_skips_dotfiles_and_directories() {
    let dir = TempDir::new().unwrap();
    enqueue(dir.path(), INPUT, "visible", Some("1"));
    let input = dir.path().join(INPUT);
    fs::write(input.join(".DS_Store"), "").unwrap();
    fs::create_dir_all(input.join("tmp")).unwrap();
    fs::write(input.join("tmp").join("claimed"), "").unwrap();

    let queued = list_queued(&input).unwrap();
    assert_eq!(queued, [input.join("visible")]);
    assert!(list_queued(&dir.path().join("missing")).unwrap().is_empty());
}

#[tokio::test]
async fn item_named_like_the_marker_is_left_intact() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, 0);
    let original = enqueue(&settings.main_root, INPUT, PROCESSING_MARKER, Some("real-id"));
    let before = fs::read_to_string(&original).unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    let stage = move |input: StageInput| {
        seen.fetch_add(1, Ordering::SeqCst);
        advance_unchanged(input)
    };

    let report = StageProcessor::new(spec(), Arc::new(settings.clone()), stage)
        .run(&settings.roots())
        .await;

    assert_eq!(report.advanced, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(fs::read_to_string(&original).unwrap(), before);
    assert!(names_in(&settings.main_root.join(OUTPUT)).is_empty());
}

#[test]
fn claim_refuses_the_marker_name() {
    let dir = TempDir::new().unwrap();
    let source = enqueue(dir.path(), INPUT, PROCESSING_MARKER, Some("7"));
    let tmp = dir.path().join(INPUT).join("tmp");

    assert!(claim(&source, &tmp).is_err());
    assert!(source.exists());
    assert!(!tmp.join(PROCESSING_MARKER).exists());
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

fn two_stage_pipeline(settings: PipelineSettings) -> Pipeline<Stamp> {
    Pipeline::new(settings)
        .stage(
            StageSpec::new("dedup", "01_parsed", "02_deduped", "51_rejected_duplicate"),
            Stamp("dedup"),
        )
        .stage(spec(), Stamp("categorize"))
}

#[tokio::test]
async fn pipeline_moves_item_through_every_stage_in_one_run() {
    let dir = TempDir::new().unwrap();
    let pipeline = two_stage_pipeline(settings(&dir, 0));
    pipeline.ensure_layout().unwrap();
    let main = pipeline.settings().main_root.clone();
    enqueue(&main, "01_parsed", "item-1", Some("1"));

    let report = pipeline.run(&pipeline.settings().roots(), None).await;

    assert_eq!(report.advanced, 2);
    let done = item_store::parse(&main.join(OUTPUT).join("item-1")).unwrap();
    assert_eq!(done.metadata.get("Visited-dedup"), Some("yes"));
    assert_eq!(done.metadata.get("Visited-categorize"), Some("yes"));
    assert_eq!(done.metadata.get(PIPELINE_STAGE), Some(OUTPUT));
}

#[tokio::test]
async fn pipeline_can_run_a_single_stage() {
    let dir = TempDir::new().unwrap();
    let pipeline = two_stage_pipeline(settings(&dir, 0));
    let main = pipeline.settings().main_root.clone();
    enqueue(&main, "01_parsed", "item-1", Some("1"));

    let report = pipeline.run(&pipeline.settings().roots(), Some("dedup")).await;

    assert_eq!(report.advanced, 1);
    assert!(main.join("02_deduped").join("item-1").exists());
}

#[test]
fn ensure_layout_creates_every_directory_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let pipeline = two_stage_pipeline(settings(&dir, 0));

    pipeline.ensure_layout().unwrap();
    pipeline.ensure_layout().unwrap();

    for root in ["priority", "main"] {
        for stage_dir in ["01_parsed", "02_deduped", "51_rejected_duplicate", OUTPUT, REJECT] {
            assert!(dir.path().join(root).join(stage_dir).join("tmp").is_dir());
        }
    }
    assert!(dir.path().join("logs").is_dir());
}

#[test]
fn status_counts_queued_in_flight_and_rejected() {
    let dir = TempDir::new().unwrap();
    let pipeline = two_stage_pipeline(settings(&dir, 0));
    pipeline.ensure_layout().unwrap();
    let main = dir.path().join("main");
    enqueue(&main, "01_parsed", "a", Some("a"));
    enqueue(&main, "01_parsed", "b", Some("b"));
    enqueue(&main, "01_parsed/tmp", "c", Some("c"));
    fs::write(main.join("01_parsed").join("tmp").join(PROCESSING_MARKER), "c").unwrap();
    enqueue(&main, "51_rejected_duplicate", "d", Some("d"));

    let rows = pipeline.status().unwrap();

    assert_eq!(rows.len(), 4);
    let dedup_main = rows
        .iter()
        .find(|r| r.root == "main" && r.stage == "dedup")
        .unwrap();
    assert_eq!(dedup_main.queued, 2);
    assert_eq!(dedup_main.in_flight, 1);
    assert_eq!(dedup_main.rejected, 1);
    assert_eq!(dedup_main.processing.as_deref(), Some("c"));

    let categorize_pri = rows
        .iter()
        .find(|r| r.root == "pri" && r.stage == "categorize")
        .unwrap();
    assert_eq!((categorize_pri.queued, categorize_pri.in_flight), (0, 0));
    assert_eq!(categorize_pri.processing, None);
}
