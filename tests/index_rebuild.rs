use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use picindex::{
    CancelToken, CompositeExtractor, ContainerInspector, ExportRecord, ImageIndexRepository,
    IndexError, IndexOptions, IndexOutcome, IndexReader, IndexerService, Metadata,
    MetadataExtractor,
};

fn temp_case_dir(case: &str) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = std::env::temp_dir().join(format!(
        "picindex_it_{case}_{}_{}",
        std::process::id(),
        stamp
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_png(path: &Path, text: &[(&str, &str)]) {
    let file = fs::File::create(path).unwrap();
    let mut encoder = png::Encoder::new(std::io::BufWriter::new(file), 4, 4);
    encoder.set_color(png::ColorType::Rgba);
    encoder.set_depth(png::BitDepth::Eight);
    for (keyword, value) in text {
        encoder
            .add_text_chunk(keyword.to_string(), value.to_string())
            .unwrap();
    }
    let mut writer = encoder.write_header().unwrap();
    writer.write_image_data(&[90u8; 4 * 4 * 4]).unwrap();
}

/// Structured tags keyed by file name, standing in for the external tool.
#[derive(Default)]
struct FixedTags(HashMap<String, Vec<(String, String)>>);

impl FixedTags {
    fn with(mut self, file: &str, key: &str, value: &str) -> Self {
        self.0
            .entry(file.to_string())
            .or_default()
            .push((key.to_string(), value.to_string()));
        self
    }
}

impl MetadataExtractor for FixedTags {
    fn extract(&self, path: &Path) -> Metadata {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        self.0
            .get(&name)
            .map(|tags| tags.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Tags every file with its stem and a shared marker.
struct StemTags;

impl MetadataExtractor for StemTags {
    fn extract(&self, path: &Path) -> Metadata {
        let mut out = Metadata::new();
        let stem = path.file_stem().unwrap().to_string_lossy().to_string();
        out.insert("Test:Stem".to_string(), stem);
        out.insert("Test:Group".to_string(), "shared".to_string());
        out
    }
}

fn filenames(repo: &ImageIndexRepository, query: &str) -> Vec<String> {
    repo.search(query, 1000, 0)
        .unwrap()
        .into_iter()
        .map(|r| r.filename)
        .collect()
}

fn sequential() -> IndexOptions {
    IndexOptions {
        concurrency: 1,
        snapshot_path: None,
    }
}

fn populate(dir: &Path, count: usize) -> PathBuf {
    let pics = dir.join("pics");
    fs::create_dir_all(&pics).unwrap();
    for i in 0..count {
        fs::write(pics.join(format!("img{i:03}.jpg")), format!("jpeg {i}")).unwrap();
    }
    pics
}

#[test]
fn mixed_folder_scenario() {
    let dir = temp_case_dir("scenario");
    let pics = dir.join("pics");
    fs::create_dir_all(&pics).unwrap();
    fs::write(pics.join("a.jpg"), b"not really a jpeg").unwrap();
    write_png(&pics.join("b.png"), &[("Comment", "hello")]);
    fs::write(pics.join("notes.txt"), b"ignored").unwrap();

    let extractor = CompositeExtractor::new(
        FixedTags::default().with("a.jpg", "Camera:Model", "X"),
        ContainerInspector,
    );
    let service = IndexerService::new(extractor);
    let mut repo = ImageIndexRepository::open(dir.join("index.db")).unwrap();
    let folders = vec![pics.clone()];

    let outcome = service
        .build_index(&mut repo, &folders, &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    assert_eq!(outcome.indexed(), 2);
    assert!(!outcome.is_canceled());

    assert_eq!(filenames(&repo, "X"), vec!["a.jpg"]);
    assert_eq!(filenames(&repo, "hello"), vec!["b.png"]);
    assert_eq!(filenames(&repo, ""), vec!["a.jpg", "b.png"]);

    let b = &repo.search("hello", 10, 0).unwrap()[0];
    assert_eq!(b.metadata().unwrap()["Container:Comment"], "hello");

    fs::remove_file(pics.join("b.png")).unwrap();
    let outcome = service
        .build_index(&mut repo, &folders, &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    assert_eq!(
        outcome,
        IndexOutcome::Completed {
            indexed: 1,
            removed: 1,
            skipped: 0,
            total: 1,
        }
    );
    assert_eq!(repo.count("").unwrap(), 1);
    assert!(filenames(&repo, "hello").is_empty());
    assert_eq!(repo.search_entry_count().unwrap(), repo.record_count().unwrap());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn rebuild_is_idempotent() {
    let dir = temp_case_dir("idempotent");
    let pics = populate(&dir, 12);
    let service = IndexerService::new(StemTags);
    let mut repo = ImageIndexRepository::open(dir.join("index.db")).unwrap();

    service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    let first_all = repo.search("", 100, 0).unwrap();
    let first_shared = filenames(&repo, "shared");

    service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    assert_eq!(repo.search("", 100, 0).unwrap(), first_all);
    assert_eq!(filenames(&repo, "shared"), first_shared);
    assert_eq!(repo.record_count().unwrap(), 12);
    assert_eq!(repo.search_entry_count().unwrap(), 12);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn changed_file_keeps_its_id() {
    let dir = temp_case_dir("stable_id");
    let pics = populate(&dir, 3);
    let service = IndexerService::new(StemTags);
    let mut repo = ImageIndexRepository::open(dir.join("index.db")).unwrap();

    service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    let target = std::path::absolute(pics.join("img001.jpg")).unwrap();
    let key = target.to_string_lossy().to_string();
    let before = repo.record_id(&key).unwrap().unwrap();

    fs::write(&target, b"a much longer replacement body").unwrap();
    service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();

    assert_eq!(repo.record_id(&key).unwrap(), Some(before));
    let record = repo
        .all_records()
        .unwrap()
        .into_iter()
        .find(|r| r.id == before)
        .unwrap();
    assert_eq!(record.size, 30);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn cancel_keeps_previous_records_and_search_entries() {
    let dir = temp_case_dir("cancel");
    let pics = populate(&dir, 6);
    let service = IndexerService::new(StemTags);
    let mut repo = ImageIndexRepository::open(dir.join("index.db")).unwrap();

    service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    assert_eq!(repo.record_count().unwrap(), 6);

    fs::remove_file(pics.join("img005.jpg")).unwrap();
    let snapshot = dir.join("snapshot.json");
    let options = IndexOptions {
        concurrency: 1,
        snapshot_path: Some(snapshot.clone()),
    };
    let cancel = CancelToken::new();
    let outcome = service
        .build_index(&mut repo, &[pics.clone()], &options, &cancel, |p| {
            if p.completed == 2 {
                cancel.cancel();
            }
        })
        .unwrap();

    assert_eq!(outcome, IndexOutcome::Canceled { indexed: 2, total: 5 });
    assert_eq!(repo.record_count().unwrap(), 6);
    assert_eq!(repo.search_entry_count().unwrap(), 6);
    assert_eq!(repo.count("shared").unwrap(), 6);
    assert_eq!(filenames(&repo, "img005"), vec!["img005.jpg"]);
    assert!(!snapshot.exists());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn concurrent_rebuild_indexes_everything_once() {
    let dir = temp_case_dir("concurrent");
    let pics = populate(&dir, 40);
    fs::create_dir_all(pics.join("nested")).unwrap();
    write_png(&pics.join("nested").join("deep.png"), &[]);

    let service = IndexerService::new(StemTags);
    let mut repo = ImageIndexRepository::open(dir.join("index.db")).unwrap();
    let options = IndexOptions {
        concurrency: 8,
        snapshot_path: Some(dir.join("export").join("all.json")),
    };

    let mut events = Vec::new();
    let outcome = service
        .build_index(&mut repo, &[pics.clone()], &options, &CancelToken::new(), |p| {
            events.push((p.completed, p.total))
        })
        .unwrap();

    assert_eq!(outcome.indexed(), 41);
    assert_eq!(events.len(), 41);
    assert!(events.iter().all(|(_, total)| *total == 41));
    let completed: Vec<usize> = events.iter().map(|(c, _)| *c).collect();
    assert_eq!(completed, (1..=41).collect::<Vec<_>>());
    assert_eq!(repo.record_count().unwrap(), 41);
    assert_eq!(repo.search_entry_count().unwrap(), 41);

    let raw = fs::read_to_string(dir.join("export").join("all.json")).unwrap();
    let exported: Vec<ExportRecord> = serde_json::from_str(&raw).unwrap();
    assert_eq!(exported.len(), 41);
    assert!(exported
        .iter()
        .all(|record| record.metadata["Test:Group"] == "shared"));

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn missing_folder_clears_index_on_completion() {
    let dir = temp_case_dir("missing_root");
    let pics = populate(&dir, 2);
    let service = IndexerService::new(StemTags);
    let mut repo = ImageIndexRepository::open(dir.join("index.db")).unwrap();

    service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    fs::remove_dir_all(&pics).unwrap();

    let outcome = service
        .build_index(&mut repo, &[pics], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    assert_eq!(
        outcome,
        IndexOutcome::Completed {
            indexed: 0,
            removed: 2,
            skipped: 0,
            total: 0,
        }
    );
    assert_eq!(repo.record_count().unwrap(), 0);
    assert_eq!(repo.search_entry_count().unwrap(), 0);

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn store_failure_rolls_back_the_whole_rebuild() {
    let dir = temp_case_dir("store_failure");
    let pics = populate(&dir, 2);
    let service = IndexerService::new(StemTags);
    let mut repo = ImageIndexRepository::open(dir.join("index.db")).unwrap();

    service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    let before = repo.search("", 100, 0).unwrap();

    fs::write(pics.join("boom.jpg"), b"boom").unwrap();
    fs::write(pics.join("zzz.jpg"), b"later").unwrap();
    let other = rusqlite::Connection::open(repo.path()).unwrap();
    other
        .execute_batch(
            "CREATE TRIGGER reject_boom BEFORE INSERT ON images \
             WHEN NEW.filename = 'boom.jpg' \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .unwrap();

    let result =
        service.build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {});

    assert!(matches!(result, Err(IndexError::Store(_))), "{result:?}");
    assert_eq!(repo.record_count().unwrap(), 2);
    assert_eq!(repo.search_entry_count().unwrap(), 2);
    assert_eq!(repo.count("shared").unwrap(), 2);
    assert_eq!(repo.search("", 100, 0).unwrap(), before);
    assert!(filenames(&repo, "zzz").is_empty());

    let _ = fs::remove_dir_all(dir);
}

#[test]
fn readers_see_the_previous_index_during_a_rebuild() {
    let dir = temp_case_dir("reader_isolation");
    let pics = populate(&dir, 4);
    let service = IndexerService::new(StemTags);
    let mut repo = ImageIndexRepository::open(dir.join("index.db")).unwrap();

    service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |_| {})
        .unwrap();
    fs::write(pics.join("img900.jpg"), b"new").unwrap();

    let (midway_tx, midway_rx) = mpsc::channel::<()>();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    let db = repo.path().to_path_buf();
    let observer = std::thread::spawn(move || {
        midway_rx.recv().unwrap();
        let reader = IndexReader::open(&db).unwrap();
        let seen = (
            reader.count("shared").unwrap(),
            reader.count("").unwrap(),
            reader.count("img900").unwrap(),
        );
        resume_tx.send(()).unwrap();
        seen
    });

    let outcome = service
        .build_index(&mut repo, &[pics.clone()], &sequential(), &CancelToken::new(), |p| {
            if p.completed == 3 {
                midway_tx.send(()).unwrap();
                resume_rx.recv().unwrap();
            }
        })
        .unwrap();

    assert_eq!(observer.join().unwrap(), (4, 4, 0));
    assert_eq!(outcome.indexed(), 5);
    assert_eq!(repo.count("shared").unwrap(), 5);

    let _ = fs::remove_dir_all(dir);
}
