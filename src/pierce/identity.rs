use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use directories::ProjectDirs;
use rand::RngCore;

use crate::pierce::tunnel::protocol::{CLIENT_ID_LEN, ClientId};

const ID_FILE: &str = "client.id";

/// The persisted identity of this installation. Generated on first use and
/// reused so the relay recognizes reconnecting tunnels as the same owner.
pub fn client_id() -> anyhow::Result<ClientId> {
    load_or_create(&id_path()?)
}

fn id_path() -> anyhow::Result<PathBuf> {
    let dirs =
        ProjectDirs::from("", "", "pierce").context("identity: no home directory available")?;
    Ok(dirs.data_dir().join(ID_FILE))
}

pub fn load_or_create(path: &Path) -> anyhow::Result<ClientId> {
    if let Ok(existing) = fs::read_to_string(path) {
        if let Some(id) = ClientId::parse(&existing) {
            return Ok(id);
        }
        tracing::warn!(path = %path.display(), "identity: stored id is malformed, regenerating");
    }

    let mut seed = [0u8; CLIENT_ID_LEN / 2];
    rand::rng().fill_bytes(&mut seed);
    let encoded = hex::encode(seed);

    let mut raw = [0u8; CLIENT_ID_LEN];
    raw.copy_from_slice(encoded.as_bytes());
    let id = ClientId::from(raw);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("identity: mkdir {}", parent.display()))?;
    }
    fs::write(path, &encoded).with_context(|| format!("identity: write {}", path.display()))?;
    tracing::info!(id = %id, path = %path.display(), "identity: generated new client id");
    Ok(id)
}
