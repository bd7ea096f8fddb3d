//! End-to-end melt scenarios against synthetic docker-save archives.
//!
//! Each test builds a save archive in a temporary staging tree, melts it
//! into an output archive, and inspects the result with an independent tar
//! reader: layer contents, manifest and config patches, digest stability,
//! and the preservation of JSON fields the engine does not model.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use tar::{Archive, EntryType, Header};
use tempfile::TempDir;

use melt_rs::{MeltOutcome, melt_archive};

fn current_ids() -> (u64, u64) {
    (
        nix::unistd::getuid().as_raw() as u64,
        nix::unistd::getgid().as_raw() as u64,
    )
}

/// Append a regular file entry with fixed mtime and current ownership.
fn append_file(builder: &mut tar::Builder<File>, path: &str, contents: &str) {
    let (uid, gid) = current_ids();
    let mut header = Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_uid(uid);
    header.set_gid(gid);
    header.set_mtime(1_456_000_000);
    header.set_entry_type(EntryType::Regular);
    builder
        .append_data(&mut header, path, contents.as_bytes())
        .unwrap();
}

/// Create `<hash>/layer.tar` under the staging tree, plus the legacy
/// metadata files docker-save writes next to it.
fn build_layer(staging: &Path, hash: &str, files: &[(&str, &str)]) {
    let layer_dir = staging.join(hash);
    fs::create_dir_all(&layer_dir).unwrap();

    let tar_file = File::create(layer_dir.join("layer.tar")).unwrap();
    let mut builder = tar::Builder::new(tar_file);
    for (path, contents) in files {
        append_file(&mut builder, path, contents);
    }
    builder.finish().unwrap();

    fs::write(layer_dir.join("VERSION"), "1.0").unwrap();
    fs::write(layer_dir.join("json"), "{}").unwrap();
}

/// A config blob with fields the engine does not model, so preservation can
/// be asserted byte-for-byte.
fn config_json(history: &[(&str, bool)], diff_ids: &[&str]) -> String {
    let history: Vec<String> = history
        .iter()
        .map(|(created_by, empty)| {
            if *empty {
                format!(r#"{{"created_by":"{created_by}","empty_layer":true}}"#)
            } else {
                format!(
                    r#"{{"created":"2016-03-01T00:00:00Z","created_by":"{created_by}"}}"#
                )
            }
        })
        .collect();
    let diff_ids: Vec<String> = diff_ids.iter().map(|id| format!("\"{id}\"")).collect();
    format!(
        concat!(
            r#"{{"architecture":"amd64","config":{{"Cmd":["/bin/sh"]}},"#,
            r#""custom_field":{{"keep":true}},"history":[{history}],"os":"linux","#,
            r#""rootfs":{{"type":"layers","diff_ids":[{diff_ids}]}}}}"#
        ),
        history = history.join(","),
        diff_ids = diff_ids.join(","),
    )
}

/// Pack the staging tree into a save archive.
fn build_save_archive(staging: &Path, out: &Path) {
    melt_rs::pack::pack_dir(staging, staging, out).unwrap();
}

/// Read every entry of a tar stream into name → (type, bytes).
fn read_entries<R: Read>(reader: R) -> HashMap<String, (u8, Vec<u8>)> {
    let mut archive = Archive::new(reader);
    let mut entries = HashMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().display().to_string();
        let entry_type = entry.header().entry_type().as_byte();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        entries.insert(name, (entry_type, contents));
    }
    entries
}

fn entry_bytes<'a>(entries: &'a HashMap<String, (u8, Vec<u8>)>, name: &str) -> &'a [u8] {
    let (_, bytes) = entries
        .get(name)
        .unwrap_or_else(|| panic!("archive has no entry {name:?}"));
    bytes
}

fn json_value(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).unwrap()
}

#[test]
fn test_single_image_three_layers_melt_to_one() {
    let tmp = TempDir::new().unwrap();
    let staging = tmp.path().join("staging");
    fs::create_dir(&staging).unwrap();

    build_layer(
        &staging,
        "aa",
        &[("etc/a", "a"), ("etc/common", "from-a")],
    );
    build_layer(
        &staging,
        "bb",
        &[("etc/b", "b"), ("etc/common", "from-b")],
    );
    build_layer(
        &staging,
        "cc",
        &[("etc/c", "c"), ("etc/common", "from-c")],
    );
    fs::write(
        staging.join("cfg.json"),
        config_json(
            &[("ADD rootfs", false), ("RUN b", false), ("RUN c", false)],
            &["sha256:old-aa", "sha256:old-bb", "sha256:old-cc"],
        ),
    )
    .unwrap();
    fs::write(
        staging.join("manifest.json"),
        concat!(
            r#"[{"Config":"cfg.json","RepoTags":["test:latest"],"Extra":"keep","#,
            r#""Layers":["aa/layer.tar","bb/layer.tar","cc/layer.tar"]}]"#
        ),
    )
    .unwrap();

    let input = tmp.path().join("input.tar");
    build_save_archive(&staging, &input);

    let output = tmp.path().join("output.tar");
    let work = TempDir::new().unwrap();
    let outcome = melt_archive(&input, &output, work.path()).unwrap();
    assert_eq!(
        outcome,
        MeltOutcome::Melted {
            input_layers: 3,
            output_layers: 1
        }
    );

    let entries = read_entries(File::open(&output).unwrap());

    // The manifest names a single layer and keeps the field we never model.
    let manifest_bytes = entry_bytes(&entries, "manifest.json");
    assert!(
        std::str::from_utf8(manifest_bytes)
            .unwrap()
            .contains(r#""Extra":"keep""#)
    );
    let manifest = json_value(manifest_bytes);
    assert_eq!(
        manifest[0]["Layers"],
        serde_json::json!(["aa/layer.tar"])
    );

    // Legacy metadata files are stripped, melted layers are gone.
    assert!(!entries.contains_key("aa/VERSION"));
    assert!(!entries.contains_key("aa/json"));
    assert!(!entries.contains_key("bb/layer.tar"));
    assert!(!entries.contains_key("cc/layer.tar"));

    // The surviving layer is the union, with upper layers winning.
    let layer = read_entries(entry_bytes(&entries, "aa/layer.tar"));
    assert_eq!(entry_bytes(&layer, "etc/a"), b"a");
    assert_eq!(entry_bytes(&layer, "etc/b"), b"b");
    assert_eq!(entry_bytes(&layer, "etc/c"), b"c");
    assert_eq!(entry_bytes(&layer, "etc/common"), b"from-c");

    // The config keeps unknown fields and carries exactly one diff-id: the
    // digest of the rewritten layer archive.
    let config_bytes = entry_bytes(&entries, "cfg.json");
    assert!(
        std::str::from_utf8(config_bytes)
            .unwrap()
            .contains(r#""custom_field":{"keep":true}"#)
    );
    let config = json_value(config_bytes);
    let diff_ids = config["rootfs"]["diff_ids"].as_array().unwrap();
    assert_eq!(diff_ids.len(), 1);
    let expected = format!(
        "sha256:{:x}",
        Sha256::digest(entry_bytes(&entries, "aa/layer.tar"))
    );
    assert_eq!(diff_ids[0], serde_json::json!(expected));
    assert_eq!(config["history"].as_array().unwrap().len(), 1);

    // Melting the output again finds a single layer and declines.
    let work2 = TempDir::new().unwrap();
    let output2 = tmp.path().join("output2.tar");
    let outcome2 = melt_archive(&output, &output2, work2.path()).unwrap();
    assert!(matches!(outcome2, MeltOutcome::NothingToDo(_)));
    assert!(!output2.exists());
}

#[test]
fn test_whiteouts_are_applied_and_not_copied() {
    let tmp = TempDir::new().unwrap();
    let staging = tmp.path().join("staging");
    fs::create_dir(&staging).unwrap();

    build_layer(
        &staging,
        "aa",
        &[("etc/foo", "doomed"), ("etc/keep", "keep")],
    );
    build_layer(&staging, "bb", &[("etc/.wh.foo", "")]);
    fs::write(
        staging.join("cfg.json"),
        config_json(
            &[("ADD rootfs", false), ("RUN rm /etc/foo", false)],
            &["sha256:old-aa", "sha256:old-bb"],
        ),
    )
    .unwrap();
    fs::write(
        staging.join("manifest.json"),
        r#"[{"Config":"cfg.json","Layers":["aa/layer.tar","bb/layer.tar"]}]"#,
    )
    .unwrap();

    let input = tmp.path().join("input.tar");
    build_save_archive(&staging, &input);

    let output = tmp.path().join("output.tar");
    let work = TempDir::new().unwrap();
    melt_archive(&input, &output, work.path()).unwrap();

    let entries = read_entries(File::open(&output).unwrap());
    let layer = read_entries(entry_bytes(&entries, "aa/layer.tar"));

    assert!(!layer.contains_key("etc/foo"));
    assert_eq!(entry_bytes(&layer, "etc/keep"), b"keep");
    for name in layer.keys() {
        let basename = name.rsplit('/').next().unwrap();
        assert!(
            !basename.starts_with(".wh."),
            "whiteout marker leaked into the output: {name}"
        );
    }
}

#[test]
fn test_two_images_with_shared_prefix() {
    let tmp = TempDir::new().unwrap();
    let staging = tmp.path().join("staging");
    fs::create_dir(&staging).unwrap();

    build_layer(&staging, "aa", &[("base", "base")]);
    build_layer(&staging, "bb", &[("shared", "shared")]);
    build_layer(&staging, "x1", &[("only-x", "x")]);
    build_layer(&staging, "y1", &[("only-y", "y")]);
    fs::write(
        staging.join("cfg-x.json"),
        config_json(
            &[("ADD rootfs", false), ("RUN shared", false), ("RUN x", false)],
            &["sha256:old-aa", "sha256:old-bb", "sha256:old-x1"],
        ),
    )
    .unwrap();
    fs::write(
        staging.join("cfg-y.json"),
        config_json(
            &[("ADD rootfs", false), ("RUN shared", false), ("RUN y", false)],
            &["sha256:old-aa", "sha256:old-bb", "sha256:old-y1"],
        ),
    )
    .unwrap();
    fs::write(
        staging.join("manifest.json"),
        concat!(
            r#"[{"Config":"cfg-x.json","RepoTags":["x:latest"],"#,
            r#""Layers":["aa/layer.tar","bb/layer.tar","x1/layer.tar"]},"#,
            r#"{"Config":"cfg-y.json","RepoTags":["y:latest"],"#,
            r#""Layers":["aa/layer.tar","bb/layer.tar","y1/layer.tar"]}]"#
        ),
    )
    .unwrap();

    let input = tmp.path().join("input.tar");
    build_save_archive(&staging, &input);

    let output = tmp.path().join("output.tar");
    let work = TempDir::new().unwrap();
    let outcome = melt_archive(&input, &output, work.path()).unwrap();
    assert_eq!(
        outcome,
        MeltOutcome::Melted {
            input_layers: 6,
            output_layers: 3
        }
    );

    let entries = read_entries(File::open(&output).unwrap());

    // The shared boundary layer bb folded into the shared root aa; the
    // unique tails survived on their own.
    assert!(entries.contains_key("aa/layer.tar"));
    assert!(entries.contains_key("x1/layer.tar"));
    assert!(entries.contains_key("y1/layer.tar"));
    assert!(!entries.contains_key("bb/layer.tar"));

    let merged = read_entries(entry_bytes(&entries, "aa/layer.tar"));
    assert_eq!(entry_bytes(&merged, "base"), b"base");
    assert_eq!(entry_bytes(&merged, "shared"), b"shared");

    let manifest = json_value(entry_bytes(&entries, "manifest.json"));
    assert_eq!(
        manifest[0]["Layers"],
        serde_json::json!(["aa/layer.tar", "x1/layer.tar"])
    );
    assert_eq!(
        manifest[1]["Layers"],
        serde_json::json!(["aa/layer.tar", "y1/layer.tar"])
    );

    // Both images name the same rewritten shared layer.
    let config_x = json_value(entry_bytes(&entries, "cfg-x.json"));
    let config_y = json_value(entry_bytes(&entries, "cfg-y.json"));
    assert_eq!(
        config_x["rootfs"]["diff_ids"][0],
        config_y["rootfs"]["diff_ids"][0]
    );
    assert_ne!(
        config_x["rootfs"]["diff_ids"][1],
        config_y["rootfs"]["diff_ids"][1]
    );
}

#[test]
fn test_all_layers_shared_is_a_clean_no_op() {
    let tmp = TempDir::new().unwrap();
    let staging = tmp.path().join("staging");
    fs::create_dir(&staging).unwrap();

    build_layer(&staging, "aa", &[("base", "base")]);
    build_layer(&staging, "bb", &[("top", "top")]);
    for name in ["cfg-x.json", "cfg-y.json"] {
        fs::write(
            staging.join(name),
            config_json(
                &[("ADD rootfs", false), ("RUN top", false)],
                &["sha256:old-aa", "sha256:old-bb"],
            ),
        )
        .unwrap();
    }
    fs::write(
        staging.join("manifest.json"),
        concat!(
            r#"[{"Config":"cfg-x.json","Layers":["aa/layer.tar","bb/layer.tar"]},"#,
            r#"{"Config":"cfg-y.json","Layers":["aa/layer.tar","bb/layer.tar"]}]"#
        ),
    )
    .unwrap();

    let input = tmp.path().join("input.tar");
    build_save_archive(&staging, &input);

    let output = tmp.path().join("output.tar");
    let work = TempDir::new().unwrap();
    let outcome = melt_archive(&input, &output, work.path()).unwrap();
    let MeltOutcome::NothingToDo(reason) = outcome else {
        panic!("expected a clean no-op, got {outcome:?}");
    };
    assert!(reason.contains("shared"));
    assert!(!output.exists());
}

#[test]
fn test_empty_layer_history_entries_survive_a_full_melt() {
    let tmp = TempDir::new().unwrap();
    let staging = tmp.path().join("staging");
    fs::create_dir(&staging).unwrap();

    for (hash, file) in [("aa", "f0"), ("bb", "f1"), ("cc", "f2"), ("dd", "f3")] {
        build_layer(&staging, hash, &[(file, hash)]);
    }
    fs::write(
        staging.join("cfg.json"),
        config_json(
            &[
                ("ADD rootfs", false),
                ("RUN one", false),
                ("ENV version=1", true),
                ("RUN two", false),
                ("RUN three", false),
            ],
            &[
                "sha256:old-aa",
                "sha256:old-bb",
                "sha256:old-cc",
                "sha256:old-dd",
            ],
        ),
    )
    .unwrap();
    fs::write(
        staging.join("manifest.json"),
        concat!(
            r#"[{"Config":"cfg.json","#,
            r#""Layers":["aa/layer.tar","bb/layer.tar","cc/layer.tar","dd/layer.tar"]}]"#
        ),
    )
    .unwrap();

    let input = tmp.path().join("input.tar");
    build_save_archive(&staging, &input);

    let output = tmp.path().join("output.tar");
    let work = TempDir::new().unwrap();
    let outcome = melt_archive(&input, &output, work.path()).unwrap();
    assert_eq!(
        outcome,
        MeltOutcome::Melted {
            input_layers: 4,
            output_layers: 1
        }
    );

    let entries = read_entries(File::open(&output).unwrap());
    let config = json_value(entry_bytes(&entries, "cfg.json"));
    let history = config["history"].as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["created_by"], serde_json::json!("ADD rootfs"));
    assert_eq!(history[0].get("empty_layer"), None);
    assert_eq!(history[1]["empty_layer"], serde_json::json!(true));

    let layer = read_entries(entry_bytes(&entries, "aa/layer.tar"));
    for file in ["f0", "f1", "f2", "f3"] {
        assert!(layer.contains_key(file), "missing {file}");
    }
}
