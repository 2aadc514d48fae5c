use std::collections::{HashMap, HashSet};
use std::net::TcpListener;
use std::thread;

use anyhow::{Result, anyhow};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde_json::json;
use tiny_http::{Response, Server};

use quarry_store::{
    ArtifactStore, Digest, Keyring, RegistryIndex, TrustPolicy, Verifier, VersionEntry,
};

/// Serve a fixed path → body map until the test process exits.
fn serve_routes(routes: HashMap<String, Vec<u8>>) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let server =
        Server::from_listener(listener, None).map_err(|err| anyhow!("server error: {err}"))?;
    thread::spawn(move || {
        for request in server.incoming_requests() {
            let response = match routes.get(request.url()) {
                Some(body) => Response::from_data(body.clone()),
                None => Response::from_data(b"missing".to_vec()).with_status_code(404),
            };
            let _ = request.respond(response);
        }
    });
    Ok(format!("http://{addr}"))
}

fn tgz_with(content: &[u8]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o755);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder.append_data(&mut header, "plugin", content).unwrap();
    builder.into_inner().unwrap().finish().unwrap()
}

fn version_entry(url: &str, body: &[u8]) -> Result<VersionEntry> {
    let digest = Digest::compute(body).to_string();
    let doc = json!({
        "schema_version": "1",
        "generated_at": "2025-06-02T00:00:00Z",
        "plugins": [{
            "name": "demo/plugin",
            "versions": [{
                "version": "1.0.0",
                "api_version": "v1",
                "published_at": "2025-06-01T12:00:00Z",
                "digest": digest,
                "artifacts": [
                    {"os": "linux", "arch": "amd64", "url": url, "size": body.len(), "digest": digest}
                ],
            }],
        }],
    });
    let index = RegistryIndex::from_slice(doc.to_string().as_bytes())?;
    Ok(index.plugins[0].versions[0].clone())
}

/// Fetch three distinct artifacts into one cache, returning their hex
/// digests.
fn populate(store: &ArtifactStore, base_url: &str, routes: &[(&str, Vec<u8>)]) -> Result<Vec<String>> {
    let mut digests = Vec::new();
    for (path, body) in routes {
        let entry = version_entry(&format!("{base_url}{path}"), body)?;
        let installed = store.fetch_for("demo/plugin", &entry, "linux", "amd64")?;
        assert!(installed.extract_dir.is_some());
        digests.push(installed.digest.hex().to_string());
    }
    Ok(digests)
}

#[test]
fn gc_keeps_referenced_and_sweeps_the_rest() -> Result<()> {
    let bodies = vec![
        ("/a.tgz", tgz_with(b"artifact a")),
        ("/b.tgz", tgz_with(b"artifact b")),
        ("/c.tgz", tgz_with(b"artifact c")),
    ];
    let base_url = serve_routes(
        bodies
            .iter()
            .map(|(path, body)| (path.to_string(), body.clone()))
            .collect(),
    )?;

    let temp = tempfile::tempdir()?;
    let store = ArtifactStore::builder()
        .cache_dir(temp.path())
        .verifier(Verifier::new(Keyring::new(), TrustPolicy::permissive()))
        .build()?;
    let digests = populate(&store, &base_url, &bodies)?;
    let (a, b, c) = (&digests[0], &digests[1], &digests[2]);

    let referenced: HashSet<String> = [format!("sha256:{a}")].into();
    let result = store.gc(&referenced, false).map_err(|err| anyhow!("{err}"))?;

    assert_eq!(result.removed_blobs.len(), 2);
    assert_eq!(result.removed_dirs.len(), 2);
    assert!(result.bytes_reclaimed > 0);
    for hex in [b, c] {
        assert!(result.removed_blobs.contains(hex));
        assert!(result.removed_dirs.contains(hex));
    }

    // A's blob and tree survive; B and C are gone, shard dirs included
    // (unless they share a shard with A).
    let a_digest = Digest::parse(&format!("sha256:{a}"))?;
    assert!(store.has(&a_digest));
    assert!(store.extract_path(&a_digest).is_dir());
    for hex in [b, c] {
        assert!(!temp.path().join("sha256").join(&hex[..2]).join(hex).exists());
        assert!(
            !temp
                .path()
                .join("extracted")
                .join(&hex[..2])
                .join(hex)
                .exists()
        );
        if hex[..2] != a[..2] {
            assert!(!temp.path().join("sha256").join(&hex[..2]).exists());
        }
    }
    Ok(())
}

#[test]
fn gc_with_every_digest_referenced_changes_nothing() -> Result<()> {
    let bodies = vec![
        ("/a.tgz", tgz_with(b"gc noop a")),
        ("/b.tgz", tgz_with(b"gc noop b")),
    ];
    let base_url = serve_routes(
        bodies
            .iter()
            .map(|(path, body)| (path.to_string(), body.clone()))
            .collect(),
    )?;

    let temp = tempfile::tempdir()?;
    let store = ArtifactStore::builder()
        .cache_dir(temp.path())
        .verifier(Verifier::new(Keyring::new(), TrustPolicy::permissive()))
        .build()?;
    let digests = populate(&store, &base_url, &bodies)?;

    let referenced: HashSet<String> = digests.iter().cloned().collect();
    let result = store.gc(&referenced, false).map_err(|err| anyhow!("{err}"))?;
    assert!(result.removed_blobs.is_empty());
    assert!(result.removed_dirs.is_empty());
    assert_eq!(result.bytes_reclaimed, 0);

    for hex in &digests {
        let digest = Digest::parse(&format!("sha256:{hex}"))?;
        assert!(store.has(&digest));
        assert!(store.extract_path(&digest).is_dir());
    }
    Ok(())
}

#[test]
fn dry_run_predicts_what_a_real_run_reclaims() -> Result<()> {
    let bodies = vec![
        ("/a.tgz", tgz_with(b"dry run a")),
        ("/b.tgz", tgz_with(b"dry run b")),
    ];
    let base_url = serve_routes(
        bodies
            .iter()
            .map(|(path, body)| (path.to_string(), body.clone()))
            .collect(),
    )?;

    let temp = tempfile::tempdir()?;
    let store = ArtifactStore::builder()
        .cache_dir(temp.path())
        .verifier(Verifier::new(Keyring::new(), TrustPolicy::permissive()))
        .build()?;
    let digests = populate(&store, &base_url, &bodies)?;

    let dry = store.gc(&HashSet::new(), true).map_err(|err| anyhow!("{err}"))?;
    // Nothing was touched.
    for hex in &digests {
        let digest = Digest::parse(&format!("sha256:{hex}"))?;
        assert!(store.has(&digest));
        assert!(store.extract_path(&digest).is_dir());
    }

    let real = store.gc(&HashSet::new(), false).map_err(|err| anyhow!("{err}"))?;
    assert_eq!(dry.bytes_reclaimed, real.bytes_reclaimed);
    assert_eq!(dry.removed_blobs, real.removed_blobs);
    assert_eq!(dry.removed_dirs, real.removed_dirs);

    for hex in &digests {
        let digest = Digest::parse(&format!("sha256:{hex}"))?;
        assert!(!store.has(&digest));
    }
    Ok(())
}
