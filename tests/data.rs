use polydbm::{Dbm, EngineKind, File, FileOpenFlags, Index, OpenOptions, Result, StatusCode};
use tempfile::TempDir;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn open(path: impl AsRef<std::path::Path>, params: &[(&str, &str)]) -> Result<Dbm> {
    let mut dbm = Dbm::new();
    dbm.open(path, true, &OpenOptions::from_params(params.iter().copied())?)?;
    Ok(dbm)
}

fn fresh_file(path: &std::path::Path) -> Result<File> {
    File::open(
        path,
        true,
        FileOpenFlags {
            truncate: true,
            no_create: false,
        },
    )
}

fn fill(dbm: &Dbm, count: u32) -> Result<()> {
    for i in 1..=count {
        dbm.set(format!("{:08}", i), format!("v{}", i), true)?;
    }
    Ok(())
}

#[test]
fn flat_records_round_trip() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    let dbm = open(dir.path().join("casket.tkt"), &[])?;
    fill(&dbm, 300)?;
    dbm.set("", "empty key", true)?;
    dbm.set("empty value", "", true)?;

    let flat = fresh_file(&dir.path().join("casket.flat"))?;
    dbm.export_to_flat_records(&flat)?;
    dbm.clear()?;
    assert_eq!(0, dbm.count()?);
    dbm.import_from_flat_records(&flat)?;
    assert_eq!(302, dbm.count()?);
    assert_eq!(b"v123".to_vec(), dbm.get("00000123")?);
    assert_eq!(b"empty key".to_vec(), dbm.get("")?);
    assert_eq!(b"".to_vec(), dbm.get("empty value")?);

    let other = open("", &[("dbm", "stdhash"), ("num_shards", "3")])?;
    dbm.export(&other)?;
    assert_eq!(302, other.count()?);
    assert_eq!(dbm.export(&dbm).unwrap_err(), StatusCode::InvalidArgumentError);
    Ok(())
}

#[test]
fn search_keys_and_lines() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    let dbm = open(dir.path().join("casket.tkh"), &[("num_buckets", "50")])?;
    fill(&dbm, 100)?;

    assert_eq!(12, dbm.search("contain", b"001", 0)?.len());
    assert_eq!(3, dbm.search("contain", b"001", 3)?.len());
    assert_eq!(10, dbm.search("begin", b"0000001", 0)?.len());
    assert_eq!(10, dbm.search("end", b"1", 0)?.len());
    assert_eq!(10, dbm.search("regex", br"^\d+1$", 0)?.len());
    let nearest = dbm.search("edit", b"00000100", 3)?;
    assert_eq!(3, nearest.len());
    assert_eq!(b"00000100".to_vec(), nearest[0]);
    assert_eq!(
        dbm.search("fuzzy", b"1", 0).unwrap_err(),
        StatusCode::InvalidArgumentError
    );

    let lines = fresh_file(&dir.path().join("keys.txt"))?;
    dbm.export_keys_as_lines(&lines)?;
    assert_eq!(100, lines.read_lines()?.len());
    let mut from_lines = lines.search("end", b"1", 0)?;
    let mut from_keys = dbm.search("end", b"1", 0)?;
    from_lines.sort();
    from_keys.sort();
    assert_eq!(from_keys, from_lines);
    Ok(())
}

#[test]
fn ordered_search_follows_key_order() -> Result<()> {
    let dbm = open("", &[("dbm", "baby")])?;
    for key in ["pear", "apple", "peach", "plum", "apricot"] {
        dbm.set(key, "", true)?;
    }
    let found: Vec<String> = dbm
        .search("begin", b"p", 0)?
        .into_iter()
        .map(|key| String::from_utf8(key).unwrap())
        .collect();
    assert_eq!(vec!["peach", "pear", "plum"], found);
    Ok(())
}

#[test]
fn index_on_a_tree_file() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("index.tkt");
    let mut index = Index::new();
    index.open(&path, true, &OpenOptions::new())?;
    for (city, person) in [
        ("tokyo", "hana"),
        ("osaka", "ken"),
        ("tokyo", "aki"),
        ("kyoto", "mio"),
        ("tokyo", "ren"),
    ] {
        index.add(city, person)?;
    }
    index.synchronize(false)?;
    index.close()?;

    index.open(&path, false, &OpenOptions::new())?;
    assert!(!index.is_writable());
    assert_eq!(5, index.count()?);
    assert_eq!(
        vec![b"aki".to_vec(), b"hana".to_vec(), b"ren".to_vec()],
        index.get_values("tokyo", 0)?
    );
    assert!(index.contains("kyoto", "mio")?);
    assert!(!index.contains("kyoto", "ken")?);

    let mut pairs = Vec::new();
    let mut iter = index.make_iterator();
    iter.first()?;
    while iter.is_positioned() {
        pairs.push(iter.get()?);
        iter.next()?;
    }
    let cities: Vec<String> = pairs
        .iter()
        .map(|(city, _)| String::from_utf8_lossy(city).into_owned())
        .collect();
    assert_eq!(vec!["kyoto", "osaka", "tokyo", "tokyo", "tokyo"], cities);
    drop(iter);
    index.close()
}

#[test]
fn copied_files_open_healthy() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    for name in ["casket.tkh", "casket.tkt", "casket.tks", "casket.tkmb"] {
        let dbm = open(dir.path().join(name), &[])?;
        fill(&dbm, 40)?;
        let copy = dir.path().join(format!("copy-{}", name));
        dbm.copy_file_data(&copy, false)?;
        // The source stays usable after the copy.
        dbm.set("after", "copy", true)?;
        assert_eq!(41, dbm.count()?);

        let mut copied = Dbm::new();
        copied.open(&copy, false, &OpenOptions::new())?;
        assert!(copied.is_healthy());
        assert_eq!(40, copied.count()?);
        assert_eq!(b"v7".to_vec(), copied.get("00000007")?);
        copied.close()?;
    }

    let volatile = open("", &[("dbm", "tiny")])?;
    assert_eq!(
        volatile.copy_file_data(dir.path().join("nowhere"), false).unwrap_err(),
        StatusCode::InfeasibleError
    );
    Ok(())
}

#[test]
fn restore_hash_file() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    let old = dir.path().join("old.tkh");
    let mut dbm = open(&old, &[("num_buckets", "20")])?;
    fill(&dbm, 50)?;
    dbm.remove("00000010")?;
    dbm.close()?;

    let new = dir.path().join("new.tkh");
    let report = Dbm::restore_database(&old, &new, None, -1)?;
    assert_eq!(49, report.restored);
    assert_eq!(0, report.discarded);

    let mut restored = Dbm::new();
    restored.open(&new, false, &OpenOptions::new())?;
    assert!(restored.is_healthy());
    assert_eq!(49, restored.count()?);
    assert_eq!(restored.get("00000010").unwrap_err(), StatusCode::NotFoundError);
    restored.close()
}

#[test]
fn restore_stops_at_a_broken_flat_record() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    let old = dir.path().join("old.tkmt");
    let mut dbm = open(&old, &[])?;
    fill(&dbm, 10)?;
    dbm.close()?;

    // A key claiming five bytes where one remains.
    let file = File::open(&old, true, FileOpenFlags::default())?;
    file.append(&[5, b'a'])?;
    drop(file);

    let new = dir.path().join("new.tkmt");
    let report = Dbm::restore_database(&old, &new, Some(EngineKind::Tiny), -1)?;
    assert_eq!(10, report.restored);
    assert_eq!(1, report.discarded);

    let mut restored = Dbm::new();
    restored.open(&new, false, &OpenOptions::new())?;
    assert_eq!(10, restored.count()?);
    restored.close()
}

#[test]
fn restore_a_shard_set() -> Result<()> {
    init();
    let dir = TempDir::new().unwrap();
    let old = dir.path().join("old");
    let params = [("dbm", "hash"), ("num_shards", "3")];
    let mut dbm = open(&old, &params)?;
    fill(&dbm, 60)?;
    dbm.close()?;

    let new = dir.path().join("new");
    let report = Dbm::restore_database(&old, &new, Some(EngineKind::Hash), -1)?;
    assert_eq!(60, report.restored);

    let mut restored = Dbm::new();
    restored.open(&new, false, &OpenOptions::from_params([("dbm", "hash"), ("num_shards", "0")])?)?;
    assert_eq!(60, restored.count()?);
    restored.close()
}
