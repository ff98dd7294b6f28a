use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Barrier};
use std::thread;

use serde_json::Value;
use tempfile::tempdir;

use facegate::{AppState, EmployeeDraft, FileIdentityStore, ServiceConfig, ServiceError};
use facegate_core::{Extractor, IdentityStore};

fn facegate(data_dir: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_facegate"))
        .args(args)
        .arg("--data-dir")
        .arg(data_dir)
        .env("RUST_LOG", "error")
        .output()
        .expect("spawn facegate")
}

fn stdout_json(output: &std::process::Output) -> Value {
    assert!(
        output.status.success(),
        "facegate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let start = stdout
        .find(|c: char| c == '{' || c == '[')
        .expect("json in stdout");
    serde_json::from_str(&stdout[start..]).expect("parse stdout json")
}

#[test]
fn test_cli_records_survive_restart() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("data");

    let created = stdout_json(&facegate(
        &data_dir,
        &["create-employee", "--name", "Jan Kowalski", "--position", "Driver"],
    ));
    let id = created["id"].as_u64().unwrap();
    let token = created["qr_code_hash"].as_str().unwrap().to_string();

    let embedding_path = dir.path().join("face.json");
    std::fs::write(&embedding_path, "[0.1, 0.2, 0.3, 0.4]").unwrap();
    let slots = stdout_json(&facegate(
        &data_dir,
        &[
            "enroll",
            "--id",
            &id.to_string(),
            "--embedding",
            embedding_path.to_str().unwrap(),
        ],
    ));
    assert_eq!(slots[0]["slot"], 1);
    assert_eq!(slots[0]["dim"], 4);

    let verified = stdout_json(&facegate(&data_dir, &["verify-qr", "--token", &token]));
    assert_eq!(verified["id"], id);
    assert_eq!(verified["face_count"], 1);

    let rejected = facegate(&data_dir, &["verify-qr", "--token", "deadbeef"]);
    assert!(!rejected.status.success());

    let listed = stdout_json(&facegate(&data_dir, &["list-employees"]));
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[test]
fn test_cli_photo_enroll_without_extractor_fails() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let created = stdout_json(&facegate(&data_dir, &["create-employee", "--name", "Ewa"]));
    let id = created["id"].as_u64().unwrap().to_string();

    let photo = dir.path().join("ewa.jpg");
    std::fs::write(&photo, b"not really a jpeg").unwrap();
    let output = facegate(
        &data_dir,
        &["enroll", "--id", &id, "--image", photo.to_str().unwrap()],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not configured"));
}

#[test]
fn test_concurrent_enrollment_on_file_store() {
    let dir = tempdir().unwrap();
    let config = ServiceConfig::from_data_dir(dir.path().to_path_buf());
    let state = Arc::new(AppState::open(config, Extractor::NotConfigured).unwrap());
    let id = state
        .create_employee(EmployeeDraft {
            name: "Anna".into(),
            ..EmployeeDraft::default()
        })
        .unwrap()
        .id;
    for i in 0..4 {
        state.enroll_embedding(id, vec![i as f32, 1.0], None).unwrap();
    }

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|w| {
            let state = state.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                state.enroll_embedding(id, vec![10.0 + w as f32, 1.0], None)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<usize> = results
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|e| e.slot.get()))
        .collect();
    assert_eq!(winners, vec![5]);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(ServiceError::Capacity { .. }) | Err(ServiceError::Conflict(_))
    )));

    let reopened = FileIdentityStore::open(dir.path()).unwrap();
    let record = reopened.get(id).unwrap().unwrap();
    assert_eq!(record.slots.count(), 5);
}

#[test]
fn test_separate_handles_race_for_the_last_slot() {
    for round in 0..10 {
        let dir = tempdir().unwrap();
        let open = || {
            let config = ServiceConfig::from_data_dir(dir.path().to_path_buf());
            Arc::new(AppState::open(config, Extractor::NotConfigured).unwrap())
        };
        let states = [open(), open()];
        let id = states[0]
            .create_employee(EmployeeDraft {
                name: format!("Worker {}", round),
                ..EmployeeDraft::default()
            })
            .unwrap()
            .id;
        for i in 0..4 {
            states[1].enroll_embedding(id, vec![i as f32, 1.0], None).unwrap();
        }

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = states
            .iter()
            .enumerate()
            .map(|(w, state)| {
                let state = state.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    state.enroll_embedding(id, vec![10.0 + w as f32, 1.0], Some(w.to_string()))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_ok())
            .map(|(w, _)| w)
            .collect();
        assert_eq!(winners.len(), 1, "round {}: {:?}", round, results);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(ServiceError::Capacity { .. }) | Err(ServiceError::Conflict(_))
        )));

        let record = FileIdentityStore::open(dir.path())
            .unwrap()
            .get(id)
            .unwrap()
            .unwrap();
        assert_eq!(record.slots.count(), 5);
        assert_eq!(
            record.slots.entries()[4].provenance,
            Some(winners[0].to_string())
        );
    }
}
