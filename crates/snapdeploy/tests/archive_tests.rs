use std::io::Read;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use snapdeploy::{ArchiveError, ArchivePatcher};

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    path: String,
    link: Option<String>,
    content: Vec<u8>,
}

/// Build a .tar.gz in memory. Paths go through `append_data`, so long ones
/// get GNU long-name records.
fn build_snapshot(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);

    for (file_path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        archive.append_data(&mut header, file_path, *data).unwrap();
    }

    archive.into_inner().unwrap().finish().unwrap()
}

/// Like [`build_snapshot`] but writes the name field verbatim, leading `/`
/// included, the way gear snapshots store paths.
fn build_absolute_snapshot(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut archive = tar::Builder::new(encoder);

    for (file_path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.as_old_mut().name[..file_path.len()].copy_from_slice(file_path.as_bytes());
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        archive.append(&header, *data).unwrap();
    }

    archive.into_inner().unwrap().finish().unwrap()
}

fn read_entries(bytes: &[u8]) -> Vec<Entry> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let link = entry
                .link_name_bytes()
                .map(|l| String::from_utf8_lossy(&l).into_owned());
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            Entry {
                path,
                link,
                content,
            }
        })
        .collect()
}

fn paths(bytes: &[u8]) -> Vec<String> {
    read_entries(bytes).into_iter().map(|e| e.path).collect()
}

fn append(patcher: &ArchivePatcher, snapshot: &[u8], name: &str, content: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    patcher
        .append(snapshot, content, name, content.len() as u64, &mut out)
        .unwrap();
    out
}

fn remove(patcher: &ArchivePatcher, snapshot: &[u8], fragment: &str) -> Vec<u8> {
    let mut out = Vec::new();
    patcher.remove(snapshot, fragment, &mut out).unwrap();
    out
}

#[test]
fn append_keeps_existing_entries_in_order() {
    let snapshot = build_snapshot(&[("a", b"first"), ("b", b"second"), ("c", b"third")]);
    let patcher = ArchivePatcher::default();

    let mut out = Vec::new();
    let summary = patcher
        .append(&snapshot[..], &b"fourth"[..], "d", 6, &mut out)
        .unwrap();

    let entries = read_entries(&out);
    assert_eq!(
        entries.iter().map(|e| e.path.as_str()).collect::<Vec<_>>(),
        ["a", "b", "c", "/repo/deployments/d"]
    );
    assert_eq!(entries[1].content, b"second");
    assert_eq!(entries[3].content, b"fourth");
    assert_eq!(summary.copied, 3);
    assert_eq!(summary.added.as_deref(), Some("/repo/deployments/d"));
}

#[test]
fn remove_drops_matching_entry() {
    let snapshot = build_snapshot(&[("a", b"first"), ("b", b"second"), ("c", b"third")]);
    let patcher = ArchivePatcher::default();

    let mut out = Vec::new();
    let summary = patcher.remove(&snapshot[..], "b", &mut out).unwrap();

    assert_eq!(paths(&out), ["a", "c"]);
    assert_eq!(summary.removed, ["b"]);
    assert_eq!(summary.copied, 2);
}

#[test]
fn remove_without_match_copies_everything() {
    let snapshot = build_snapshot(&[
        ("repo/deployments/ROOT.war", b"war"),
        ("repo/.openshift/markers/java7", b""),
        ("dependencies/jbossas/env", b"JAVA_OPTS=-Xmx256m\n"),
    ]);
    let patcher = ArchivePatcher::default();

    let mut out = Vec::new();
    let summary = patcher
        .remove(&snapshot[..], "app-1.2.jar", &mut out)
        .unwrap();

    assert_eq!(read_entries(&out), read_entries(&snapshot));
    assert!(summary.removed.is_empty());
}

#[test]
fn remove_drops_every_matching_entry() {
    let snapshot = build_snapshot(&[
        ("repo/deployments/app.jar", b"v1"),
        ("repo/deployments/ROOT.war", b"war"),
        ("repo/deployments/app.jar", b"v2"),
    ]);
    let patcher = ArchivePatcher::default();

    let mut out = Vec::new();
    let summary = patcher.remove(&snapshot[..], "app.jar", &mut out).unwrap();

    assert_eq!(paths(&out), ["repo/deployments/ROOT.war"]);
    assert_eq!(summary.removed.len(), 2);
}

#[test]
fn append_then_remove_restores_original() {
    let snapshot = build_absolute_snapshot(&[
        ("/repo/.openshift/markers/hot_deploy", b""),
        ("/repo/deployments/ROOT.war", b"root"),
        ("/dependencies/jbossas/env", b"X=1\n"),
    ]);
    let patcher = ArchivePatcher::default();
    let jar: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();

    let patched = append(&patcher, &snapshot, "app-1.2.jar", &jar);
    let restored = remove(&patcher, &patched, "app-1.2.jar");

    assert_eq!(read_entries(&restored), read_entries(&snapshot));
}

#[test]
fn absolute_paths_are_preserved() {
    let snapshot = build_absolute_snapshot(&[("/repo/deployments/ROOT.war", b"root")]);
    let patcher = ArchivePatcher::default();

    let patched = append(&patcher, &snapshot, "app.jar", b"jar");

    assert_eq!(
        paths(&patched),
        ["/repo/deployments/ROOT.war", "/repo/deployments/app.jar"]
    );
}

#[test]
fn long_paths_survive_append_and_remove() {
    let long = format!("repo/{}/deep/ROOT.war", "nested-directory".repeat(8));
    assert!(long.len() > 100);
    let snapshot = build_snapshot(&[(&long, b"war"), ("short", b"s")]);
    let patcher = ArchivePatcher::default();

    let patched = append(&patcher, &snapshot, "app.jar", b"jar");
    assert_eq!(
        paths(&patched),
        [long.as_str(), "short", "/repo/deployments/app.jar"]
    );

    let removed = remove(&patcher, &patched, "short");
    assert_eq!(paths(&removed), [long.as_str(), "/repo/deployments/app.jar"]);
    assert_eq!(read_entries(&removed)[0].content, b"war");
}

#[test]
fn appended_entry_with_long_path_uses_long_name() {
    let dir = "exploded-deployments/".repeat(5);
    let patcher = ArchivePatcher::new(dir.as_str());
    let snapshot = build_snapshot(&[("a", b"a")]);
    let name = format!("{}.jar", "service".repeat(6));

    let patched = append(&patcher, &snapshot, &name, b"jar");

    let expected = patcher.entry_path(&name);
    assert!(expected.len() > 100);
    let entries = read_entries(&patched);
    assert_eq!(entries[1].path, expected);
    assert_eq!(entries[1].content, b"jar");
}

#[test]
fn long_link_targets_survive() {
    let target = format!("../../{}/current/ROOT.war", "versions".repeat(14));
    assert!(target.len() > 100);

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_mode(0o777);
    builder
        .append_link(&mut header, "repo/deployments/ROOT.war", &target)
        .unwrap();
    let snapshot = builder.into_inner().unwrap().finish().unwrap();

    let patched = append(&ArchivePatcher::default(), &snapshot, "app.jar", b"jar");

    let entries = read_entries(&patched);
    assert_eq!(entries[0].path, "repo/deployments/ROOT.war");
    assert_eq!(entries[0].link.as_deref(), Some(target.as_str()));
}

#[test]
fn pax_paths_survive() {
    let long = format!("repo/{}/app.properties", "pax".repeat(40));

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_pax_extensions([("path", long.as_bytes())])
        .unwrap();
    let mut header = tar::Header::new_ustar();
    header.set_path("repo/app.properties").unwrap();
    header.set_size(5);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append(&header, &b"a=1\nb"[..]).unwrap();
    let snapshot = builder.into_inner().unwrap().finish().unwrap();

    let removed = remove(&ArchivePatcher::default(), &snapshot, "unrelated");

    let entries = read_entries(&removed);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, long);
    assert_eq!(entries[0].content, b"a=1\nb");
}

/// A `tar --format=posix` style snapshot: global PAX header first, a ustar
/// entry whose path needs the prefix field, then a directory.
fn build_posix_snapshot(nested: &str) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let records = b"20 comment=snapshot\n";
    let mut global = tar::Header::new_ustar();
    global.set_path("pax_global_header").unwrap();
    global.set_size(records.len() as u64);
    global.set_mode(0o644);
    global.set_entry_type(tar::EntryType::XGlobalHeader);
    global.set_cksum();
    builder.append(&global, &records[..]).unwrap();

    let mut file = tar::Header::new_ustar();
    file.set_path(nested).unwrap();
    file.set_size(7);
    file.set_mode(0o644);
    file.set_entry_type(tar::EntryType::Regular);
    file.set_cksum();
    builder.append(&file, &b"<jboss>"[..]).unwrap();

    let mut dir = tar::Header::new_ustar();
    dir.set_path("repo/deployments/").unwrap();
    dir.set_size(0);
    dir.set_mode(0o755);
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_cksum();
    builder.append(&dir, std::io::empty()).unwrap();

    builder.into_inner().unwrap().finish().unwrap()
}

#[test]
fn global_pax_header_is_copied_verbatim() {
    let nested = format!("repo/{}standalone.xml", "configuration/".repeat(8));
    let snapshot = build_posix_snapshot(&nested);
    let patcher = ArchivePatcher::default();

    let untouched = remove(&patcher, &snapshot, "nomatch");
    let entries = read_entries(&untouched);
    assert_eq!(entries, read_entries(&snapshot));
    assert_eq!(entries[0].path, "pax_global_header");
    assert_eq!(entries[0].content, b"20 comment=snapshot\n");
    assert_eq!(entries[1].path, nested);

    let appended = append(&patcher, &snapshot, "app.jar", b"jar bytes");
    assert_eq!(
        paths(&appended).last().map(String::as_str),
        Some("/repo/deployments/app.jar")
    );

    let restored = remove(&patcher, &appended, "app.jar");
    assert_eq!(read_entries(&restored), read_entries(&snapshot));
}

#[test]
fn short_content_is_a_size_mismatch() {
    let snapshot = build_snapshot(&[("a", b"a")]);
    let mut out = Vec::new();

    let err = ArchivePatcher::default()
        .append(&snapshot[..], &b"abc"[..], "app.jar", 10, &mut out)
        .unwrap_err();

    assert!(
        matches!(err, ArchiveError::SizeMismatch { declared: 10, .. }),
        "{err:?}"
    );
}

#[test]
fn long_content_is_a_size_mismatch() {
    let snapshot = build_snapshot(&[("a", b"a")]);
    let mut out = Vec::new();

    let err = ArchivePatcher::default()
        .append(&snapshot[..], &b"abcdef"[..], "app.jar", 3, &mut out)
        .unwrap_err();

    assert!(
        matches!(err, ArchiveError::SizeMismatch { declared: 3, .. }),
        "{err:?}"
    );
}

#[test]
fn rejects_non_gzip_input() {
    let mut out = Vec::new();
    let err = ArchivePatcher::default()
        .remove(&b"definitely not a snapshot"[..], "app.jar", &mut out)
        .unwrap_err();

    assert!(matches!(err, ArchiveError::Corrupt(_)), "{err:?}");
}

#[test]
fn rejects_truncated_stream() {
    let big: Vec<u8> = (0..64 * 1024u32).map(|i| (i * 7 % 256) as u8).collect();
    let snapshot = build_snapshot(&[("a", &big), ("b", b"tail")]);
    let truncated = &snapshot[..snapshot.len() / 2];

    let mut out = Vec::new();
    let err = ArchivePatcher::default()
        .remove(truncated, "b", &mut out)
        .unwrap_err();

    assert!(matches!(err, ArchiveError::Corrupt(_)), "{err:?}");
}

#[test]
fn rejects_entry_names_with_separators() {
    let snapshot = build_snapshot(&[("a", b"a")]);
    let mut out = Vec::new();

    let err = ArchivePatcher::default()
        .append(&snapshot[..], &b"x"[..], "../etc/passwd", 1, &mut out)
        .unwrap_err();

    assert!(matches!(err, ArchiveError::InvalidEntryName(_)));
}

#[test]
fn rejects_empty_remove_fragment() {
    let snapshot = build_snapshot(&[("a", b"a")]);
    let mut out = Vec::new();

    let err = ArchivePatcher::default()
        .remove(&snapshot[..], "", &mut out)
        .unwrap_err();

    assert!(matches!(err, ArchiveError::InvalidEntryName(_)));
}
