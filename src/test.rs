#![allow(clippy::unwrap_used)]

use crate::{FileType, Strategy, VisitAction, VisitKind, WalkBuilder};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rec {
    path: Vec<u8>,
    kind: VisitKind,
    ftype: FileType,
    error: Option<i32>,
    depth: u32,
}

fn record(builder: WalkBuilder) -> (Vec<Rec>, crate::Result<()>) {
    let mut recs = Vec::new();
    let result = builder.run(|visit| {
        recs.push(Rec {
            path: visit.path().to_vec(),
            kind: visit.kind(),
            ftype: visit.file_type(),
            error: visit.error(),
            depth: visit.depth(),
        });
        VisitAction::Continue
    });
    (recs, result)
}

/// Paths relative to `base`, keeping visit order.
fn rel_paths(recs: &[Rec], base: &Path) -> Vec<String> {
    let prefix = base.as_os_str().as_bytes();
    recs.iter()
        .map(|rec| {
            let bytes = rec
                .path
                .strip_prefix(prefix)
                .map_or(&rec.path[..], |rest| rest.strip_prefix(b"/").unwrap_or(rest));
            String::from_utf8_lossy(bytes).into_owned()
        })
        .collect()
}

/// The `a/{b, c/d}` tree from the walk-order scenarios.
fn order_tree() -> (TempDir, PathBuf) {
    let tmp = tempfile::tempdir().unwrap();
    let a = tmp.path().join("a");
    fs::create_dir(&a).unwrap();
    fs::write(a.join("b"), b"").unwrap();
    fs::create_dir(a.join("c")).unwrap();
    fs::write(a.join("c").join("d"), b"").unwrap();
    (tmp, a)
}

#[test]
fn bfs_pre_order_is_level_sorted() {
    let (tmp, a) = order_tree();
    let (recs, result) = record(
        WalkBuilder::new(&a)
            .strategy(Strategy::Bfs)
            .sort(true),
    );
    result.unwrap();

    assert_eq!(rel_paths(&recs, tmp.path()), vec!["a", "a/b", "a/c", "a/c/d"]);
    // The law: all depth-k paths precede any depth-(k+1) path.
    let depths: Vec<u32> = recs.iter().map(|rec| rec.depth).collect();
    let mut sorted = depths.clone();
    sorted.sort_unstable();
    assert_eq!(depths, sorted);
}

#[test]
fn dfs_keeps_descendants_contiguous_between_pre_and_post() {
    let (tmp, a) = order_tree();
    let (recs, result) = record(
        WalkBuilder::new(&a)
            .strategy(Strategy::Dfs)
            .sort(true)
            .post_order(true),
    );
    result.unwrap();

    let flat: Vec<(String, VisitKind)> = rel_paths(&recs, tmp.path())
        .into_iter()
        .zip(recs.iter().map(|rec| rec.kind))
        .collect();
    assert_eq!(
        flat,
        vec![
            ("a".into(), VisitKind::Pre),
            ("a/b".into(), VisitKind::Pre),
            ("a/c".into(), VisitKind::Pre),
            ("a/c/d".into(), VisitKind::Pre),
            ("a/c".into(), VisitKind::Post),
            ("a".into(), VisitKind::Post),
        ]
    );
}

#[test]
fn unsorted_directory_streams_sort_lexicographically_on_request() {
    let tmp = tempfile::tempdir().unwrap();
    for name in ["zeta", "alpha", "01", "mid"] {
        fs::write(tmp.path().join(name), b"").unwrap();
    }
    let (recs, result) = record(WalkBuilder::new(tmp.path()).sort(true).min_depth(1));
    result.unwrap();
    assert_eq!(rel_paths(&recs, tmp.path()), vec!["01", "alpha", "mid", "zeta"]);
}

#[test]
fn symlink_cycle_yields_one_eloop_visit_and_continues() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("r");
    fs::create_dir(&root).unwrap();
    symlink(".", root.join("x")).unwrap();
    fs::write(root.join("y"), b"").unwrap();

    let (recs, result) = record(
        WalkBuilder::new(&root)
            .follow_all(true)
            .detect_cycles(true)
            .recover(true)
            .sort(true),
    );
    result.unwrap();

    let errors: Vec<&Rec> = recs.iter().filter(|rec| rec.ftype == FileType::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error, Some(libc::ELOOP));
    assert!(errors[0].path.ends_with(b"/x"));
    // The sibling after the cycle is still visited.
    assert!(recs.iter().any(|rec| rec.path.ends_with(b"/y")));
}

#[test]
fn deep_tree_completes_within_three_descriptors() {
    let tmp = tempfile::tempdir().unwrap();
    let mut dir = tmp.path().to_path_buf();
    for level in 0..10 {
        dir = dir.join(format!("level{level}"));
        fs::create_dir(&dir).unwrap();
    }
    fs::write(dir.join("leaf"), b"").unwrap();

    let (recs, result) = record(WalkBuilder::new(tmp.path()).max_open_fd(3));
    result.unwrap();
    // Root + 10 directories + the leaf file.
    assert_eq!(recs.len(), 12);
    assert!(recs.iter().any(|rec| rec.path.ends_with(b"/leaf")));
}

/// Builds a directory chain whose absolute path exceeds `PATH_MAX`, which
/// plain `std::fs` cannot do, by stepping `mkdirat`/`openat` descriptor to
/// descriptor.
fn make_overlong_chain(base: &Path, segment: &str, count: usize) -> usize {
    use crate::fs::{CPathBuf, FileDes};

    let mut cpath = CPathBuf::new();
    cpath.set(base.as_os_str().as_bytes());
    let mut fd = FileDes::open_dir_at(libc::AT_FDCWD, cpath.as_ptr()).unwrap();
    let mut total = base.as_os_str().len();

    for _ in 0..count {
        cpath.set(segment.as_bytes());
        // SAFETY: NUL-terminated name, live directory descriptor
        let rc = unsafe { libc::mkdirat(fd.as_raw(), cpath.as_ptr(), 0o755) };
        assert_eq!(rc, 0, "mkdirat failed");
        fd = FileDes::open_dir_at(fd.as_raw(), cpath.as_ptr()).unwrap();
        total += 1 + segment.len();
    }

    cpath.set(b"marker");
    // SAFETY: as above
    let marker = unsafe {
        libc::openat(
            fd.as_raw(),
            cpath.as_ptr(),
            libc::O_CREAT | libc::O_WRONLY | libc::O_CLOEXEC,
            0o644,
        )
    };
    assert!(marker >= 0);
    // SAFETY: marker was just opened
    unsafe { libc::close(marker) };
    total
}

#[test]
fn paths_beyond_path_max_are_opened_component_wise() {
    let tmp = tempfile::tempdir().unwrap();
    // Two interleaved chains of 30 ~201-byte segments: breadth-first order
    // alternates between them, so with a tiny descriptor budget each level
    // reopens cold, from a base far enough up that the composed path blows
    // PATH_MAX and must be re-driven component by component.
    for side in ["a", "b"] {
        let base = tmp.path().join(side);
        fs::create_dir(&base).unwrap();
        let segment = "s".repeat(200);
        let total = make_overlong_chain(&base, &segment, 30);
        assert!(total > 4096);
    }

    let mut longest = 0usize;
    let mut markers_seen = 0usize;
    let result = WalkBuilder::new(tmp.path())
        .strategy(Strategy::Bfs)
        .max_open_fd(3)
        .run(|visit| {
            longest = longest.max(visit.path().len());
            if visit.name() == b"marker" {
                markers_seen += 1;
            }
            VisitAction::Continue
        });
    result.unwrap();
    assert_eq!(markers_seen, 2);
    assert!(longest > 4096);
}

#[test]
fn recovery_turns_an_unreadable_directory_into_one_error_visit() {
    use std::os::unix::fs::PermissionsExt;

    // Root ignores permission bits; the scenario needs a real EACCES.
    // SAFETY: trivial syscall
    if unsafe { libc::geteuid() } == 0 {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("open")).unwrap();
    fs::write(tmp.path().join("open").join("file"), b"").unwrap();
    let locked = tmp.path().join("locked");
    fs::create_dir(&locked).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0)).unwrap();

    let (recs, result) = record(WalkBuilder::new(tmp.path()).recover(true).sort(true));
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    result.unwrap();
    let errors: Vec<&Rec> = recs.iter().filter(|rec| rec.ftype == FileType::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error, Some(libc::EACCES));
    // The rest of the tree was still delivered.
    assert!(recs.iter().any(|rec| rec.path.ends_with(b"open/file")));
}

#[test]
fn without_recovery_the_first_errno_is_returned() {
    use std::os::unix::fs::PermissionsExt;

    // SAFETY: trivial syscall
    if unsafe { libc::geteuid() } == 0 {
        return;
    }

    let tmp = tempfile::tempdir().unwrap();
    let locked = tmp.path().join("locked");
    fs::create_dir(&locked).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0)).unwrap();

    let (recs, result) = record(WalkBuilder::new(tmp.path()));
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    let err = result.unwrap_err();
    assert_eq!(err.errno(), libc::EACCES);
    // The error still surfaced through the callback first.
    assert!(recs.iter().any(|rec| rec.ftype == FileType::Error));
}

#[test]
fn a_non_directory_root_yields_exactly_one_pre_visit() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("plain");
    fs::write(&file, b"x").unwrap();

    let (recs, result) = record(WalkBuilder::new(&file));
    result.unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].kind, VisitKind::Pre);
    assert_eq!(recs[0].ftype, FileType::RegularFile);
    assert_eq!(recs[0].error, None);
    assert_eq!(recs[0].depth, 0);
}

#[test]
fn broken_symlink_roots_follow_the_follow_roots_flag() {
    let tmp = tempfile::tempdir().unwrap();
    let link = tmp.path().join("dangling");
    symlink(tmp.path().join("nowhere"), &link).unwrap();

    // follow_roots off: the link itself, one pre visit.
    let (recs, result) = record(WalkBuilder::new(&link));
    result.unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].ftype, FileType::Symlink);

    // follow_roots on: one error visit.
    let (recs, result) = record(WalkBuilder::new(&link).follow_roots(true).recover(true));
    result.unwrap();
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].ftype, FileType::Error);
    assert_eq!(recs[0].error, Some(libc::ENOENT));
}

#[test]
fn post_order_pairs_every_directory_pre_visit() {
    let tmp = tempfile::tempdir().unwrap();
    for sub in ["a", "a/b", "a/b/c", "d", "d/e"] {
        fs::create_dir(tmp.path().join(sub)).unwrap();
    }
    fs::write(tmp.path().join("a/b/file"), b"").unwrap();

    let (recs, result) = record(
        WalkBuilder::new(tmp.path())
            .strategy(Strategy::Bfs)
            .post_order(true),
    );
    result.unwrap();

    let mut pre_dirs: Vec<&[u8]> = recs
        .iter()
        .filter(|rec| rec.kind == VisitKind::Pre && rec.ftype == FileType::Directory)
        .map(|rec| rec.path.as_slice())
        .collect();
    let mut post_dirs: Vec<&[u8]> = recs
        .iter()
        .filter(|rec| rec.kind == VisitKind::Post)
        .map(|rec| rec.path.as_slice())
        .collect();
    pre_dirs.sort_unstable();
    post_dirs.sort_unstable();
    assert_eq!(pre_dirs, post_dirs);
}

#[test]
fn stop_terminates_cleanly_without_post_visits() {
    let (_tmp, a) = order_tree();
    let mut visits = 0usize;
    let result = WalkBuilder::new(&a).post_order(true).run(|_| {
        visits += 1;
        VisitAction::Stop
    });
    result.unwrap();
    assert_eq!(visits, 1);
}

#[test]
fn prune_subtree_skips_descent_but_not_siblings() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("skipme/hidden")).unwrap();
    fs::write(tmp.path().join("skipme/hidden/file"), b"").unwrap();
    fs::write(tmp.path().join("zvisible"), b"").unwrap();

    let mut seen = Vec::new();
    let result = WalkBuilder::new(tmp.path()).sort(true).run(|visit| {
        seen.push(visit.path().to_vec());
        if visit.name() == b"skipme" {
            VisitAction::PruneSubtree
        } else {
            VisitAction::Continue
        }
    });
    result.unwrap();
    assert!(seen.iter().any(|path| path.ends_with(b"zvisible")));
    assert!(!seen.iter().any(|path| path.ends_with(b"hidden")));
}

#[test]
fn prune_siblings_abandons_the_rest_of_the_directory() {
    let tmp = tempfile::tempdir().unwrap();
    for name in ["aa", "bb", "cc"] {
        fs::write(tmp.path().join(name), b"").unwrap();
    }

    let mut seen = Vec::new();
    let result = WalkBuilder::new(tmp.path())
        .sort(true)
        .min_depth(1)
        .run(|visit| {
            seen.push(visit.name().to_vec());
            if visit.name() == b"aa" {
                VisitAction::PruneSiblings
            } else {
                VisitAction::Continue
            }
        });
    result.unwrap();
    assert_eq!(seen, vec![b"aa".to_vec()]);
}

#[test]
fn min_and_max_depth_bound_the_reported_window() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("one/two/three")).unwrap();

    let (recs, result) = record(
        WalkBuilder::new(tmp.path())
            .min_depth(1)
            .max_depth(Some(2)),
    );
    result.unwrap();
    let depths: Vec<u32> = recs.iter().map(|rec| rec.depth).collect();
    assert!(depths.iter().all(|&d| (1..=2).contains(&d)));
    assert!(recs.iter().any(|rec| rec.path.ends_with(b"/two")));
    assert!(!recs.iter().any(|rec| rec.path.ends_with(b"/three")));
}

#[test]
fn iterative_deepening_reports_each_path_exactly_once() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("a/b/c/d")).unwrap();
    fs::write(tmp.path().join("a/file"), b"").unwrap();

    for strategy in [Strategy::IterativeDeepening, Strategy::ExponentialDeepening] {
        let (recs, result) = record(WalkBuilder::new(tmp.path()).strategy(strategy).sort(true));
        result.unwrap();
        let mut paths = rel_paths(&recs, tmp.path());
        let total = paths.len();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), total, "duplicate visits under {strategy:?}");
        assert_eq!(paths, vec!["", "a", "a/b", "a/b/c", "a/b/c/d", "a/file"]);
    }
}

#[test]
fn deepening_post_order_still_pairs_directories() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("x/y")).unwrap();

    let (recs, result) = record(
        WalkBuilder::new(tmp.path())
            .strategy(Strategy::IterativeDeepening)
            .post_order(true),
    );
    result.unwrap();

    let pres = recs
        .iter()
        .filter(|rec| rec.kind == VisitKind::Pre && rec.ftype == FileType::Directory)
        .count();
    let posts = recs.iter().filter(|rec| rec.kind == VisitKind::Post).count();
    assert_eq!(pres, posts);
}

#[test]
fn deleting_siblings_mid_iteration_does_not_crash() {
    let tmp = tempfile::tempdir().unwrap();
    for index in 0..50 {
        fs::write(tmp.path().join(format!("file{index:02}")), b"").unwrap();
    }

    let base = tmp.path().to_path_buf();
    let mut removed = false;
    let result = WalkBuilder::new(tmp.path()).run(|visit| {
        if !removed && visit.depth() == 1 {
            removed = true;
            for index in 0..50 {
                let _ = fs::remove_file(base.join(format!("file{index:02}")));
            }
        }
        VisitAction::Continue
    });
    result.unwrap();
}

#[test]
fn async_walk_matches_the_synchronous_visit_set() {
    let tmp = tempfile::tempdir().unwrap();
    for dir in ["a", "a/a1", "a/a2", "b", "b/b1", "b/b1/b2"] {
        fs::create_dir(tmp.path().join(dir)).unwrap();
    }
    for file in ["a/f", "a/a1/g", "b/b1/b2/h"] {
        fs::write(tmp.path().join(file), b"").unwrap();
    }

    let (sync_recs, sync_result) = record(WalkBuilder::new(tmp.path()).sort(true));
    sync_result.unwrap();
    let (async_recs, async_result) =
        record(WalkBuilder::new(tmp.path()).sort(true).threads(2));
    async_result.unwrap();

    assert_eq!(
        rel_paths(&sync_recs, tmp.path()),
        rel_paths(&async_recs, tmp.path())
    );
}

#[test]
fn async_walk_with_buffered_stats_matches_too() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir_all(tmp.path().join("d1/d2/d3")).unwrap();
    for file in ["d1/a", "d1/d2/b", "d1/d2/d3/c"] {
        fs::write(tmp.path().join(file), b"").unwrap();
    }

    let (sync_recs, sync_result) =
        record(WalkBuilder::new(tmp.path()).sort(true).stat_every(true));
    sync_result.unwrap();
    let (async_recs, async_result) = record(
        WalkBuilder::new(tmp.path())
            .sort(true)
            .stat_every(true)
            .threads(3)
            .buffer(true),
    );
    async_result.unwrap();

    assert_eq!(
        rel_paths(&sync_recs, tmp.path()),
        rel_paths(&async_recs, tmp.path())
    );
}

#[test]
fn thousand_async_opens_round_trip_tags_and_errnos() {
    use crate::ioq::{Ioq, IoqOutput};

    let tmp = tempfile::tempdir().unwrap();
    let good = tmp.path().join("present");
    fs::create_dir(&good).unwrap();
    let good_bytes = good.as_os_str().as_bytes().to_vec();
    let bad_bytes = tmp.path().join("absent").as_os_str().as_bytes().to_vec();

    let mut ioq = Ioq::start(4);
    let total: u64 = 1000;
    let mut submitted: u64 = 0;
    let mut consumed: u64 = 0;

    while consumed < total {
        while submitted < total && ioq.in_flight() + 1 < ioq.capacity() {
            let path = if submitted % 3 == 0 { &bad_bytes } else { &good_bytes };
            ioq.submit_open_dir(submitted, libc::AT_FDCWD, path);
            submitted += 1;
        }
        let op = ioq.pop(true).unwrap();
        // Responses arrive in submission order with their tags untouched.
        assert_eq!(op.tag, consumed);
        match op.result {
            Some(Ok(IoqOutput::Fd(_))) => assert_ne!(op.tag % 3, 0),
            Some(Err(errno)) => {
                assert_eq!(op.tag % 3, 0);
                assert_eq!(errno, libc::ENOENT);
            }
            other => panic!("unexpected completion {other:?}"),
        }
        consumed += 1;
    }
}

#[test]
fn empty_roots_and_tiny_descriptor_budgets_are_rejected() {
    let result = crate::walk(&crate::WalkOptions::default(), |_| VisitAction::Continue);
    assert!(matches!(result, Err(crate::TraversalError::EmptyRoots)));

    let tmp = tempfile::tempdir().unwrap();
    let result = WalkBuilder::new(tmp.path())
        .max_open_fd(1)
        .run(|_| VisitAction::Continue);
    assert_eq!(result.unwrap_err().errno(), libc::EINVAL);
}

#[test]
fn visit_payload_resolves_at_triple_and_stats() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("target"), b"1234").unwrap();
    symlink("target", tmp.path().join("link")).unwrap();

    let result = WalkBuilder::new(tmp.path()).min_depth(1).run(|visit| {
        if visit.name() == b"target" {
            let stat = visit.stat(false).unwrap();
            assert_eq!(stat.size, 4);
            // The at triple must resolve through fstatat as well.
            let direct =
                crate::fs::fstatat(visit.at_fd(), visit.at_path().as_ptr(), false).unwrap();
            assert_eq!(direct.identity(), stat.identity());
        }
        if visit.name() == b"link" {
            assert_eq!(visit.file_type(), FileType::Symlink);
            let through = visit.stat_try_follow().unwrap();
            assert_eq!(through.file_type(), FileType::RegularFile);
        }
        VisitAction::Continue
    });
    result.unwrap();
}

#[test]
fn root_spelling_is_preserved_in_paths_and_root_field() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("dir")).unwrap();
    fs::write(tmp.path().join("dir/file"), b"").unwrap();

    let root = tmp.path().join("dir");
    let root_bytes = root.as_os_str().as_bytes().to_vec();
    let result = WalkBuilder::new(&root).run(|visit| {
        assert_eq!(visit.root(), root_bytes.as_slice());
        assert!(visit.path().starts_with(&root_bytes));
        VisitAction::Continue
    });
    result.unwrap();
}
