use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result, ResultExt};
use crate::qemu::{Arch, ConfigDelivery};

/// Token replaced with a discovery URL by [`ConfigPayload::substitute`]
pub const DISCOVERY_TOKEN: &str = "$discovery";

/// How the guest expects to read its first-boot config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncoding {
    /// Read through the firmware config channel (Ignition)
    Firmware,
    /// Read from a config-drive style filesystem (cloud-init)
    Filesystem,
}

/// Opaque first-boot config handed to a guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPayload {
    data: String,
    encoding: PayloadEncoding,
    /// Keys for the config drive metadata; Ignition payloads carry theirs
    /// inline
    public_keys: Vec<String>,
}

impl ConfigPayload {
    pub fn firmware(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            encoding: PayloadEncoding::Firmware,
            public_keys: Vec::new(),
        }
    }

    pub fn filesystem(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            encoding: PayloadEncoding::Filesystem,
            public_keys: Vec::new(),
        }
    }

    /// A payload that configures nothing
    pub fn blank() -> Self {
        Self::firmware(r#"{"ignition":{"version":"3.0.0"}}"#)
    }

    pub fn encoding(&self) -> PayloadEncoding {
        self.encoding
    }

    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// Copy with every occurrence of `token` replaced by `value`.
    pub fn substitute(&self, token: &str, value: &str) -> Self {
        Self {
            data: self.data.replace(token, value),
            ..self.clone()
        }
    }

    /// Copy that lets `user` log in with `key`.
    ///
    /// Ignition payloads get the key merged into `passwd.users`; config
    /// drive payloads get it in the metadata next to `user_data`. Adding a
    /// key twice changes nothing.
    pub fn authorize(&self, user: &str, key: &str) -> Result<Self> {
        match self.encoding {
            PayloadEncoding::Firmware => {
                let mut doc: Value = serde_json::from_str(&self.data).map_err(|e| {
                    Error::Configuration(format!("ignition payload is not JSON: {}", e))
                })?;
                add_ignition_key(&mut doc, user, key)?;
                Ok(Self {
                    data: doc.to_string(),
                    ..self.clone()
                })
            }
            PayloadEncoding::Filesystem => {
                let mut payload = self.clone();
                if !payload.public_keys.iter().any(|k| k == key) {
                    payload.public_keys.push(key.to_string());
                }
                Ok(payload)
            }
        }
    }

    /// Write the payload under `dir` in the layout `delivery_for` picked.
    ///
    /// Returns how the launcher should pass it and, for offline delivery,
    /// the file to inject.
    pub async fn stage(
        &self,
        dir: &Path,
        guest: Arch,
    ) -> Result<(ConfigDelivery, Option<PathBuf>)> {
        match delivery_for(guest, self.encoding) {
            Delivery::Offline => {
                let file = dir.join("config.ign");
                write(&file, &self.data).await?;
                Ok((ConfigDelivery::Offline, Some(file)))
            }
            Delivery::Firmware => {
                let file = dir.join("config.ign");
                write(&file, &self.data).await?;
                Ok((ConfigDelivery::Firmware(file), None))
            }
            Delivery::SharedDir => {
                let share = dir.join("config-2");
                let file = share.join("openstack").join("latest").join("user_data");
                if let Some(parent) = file.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .resource(format_args!("creating {}", parent.display()))?;
                }
                write(&file, &self.data).await?;
                let meta = file.with_file_name("meta_data.json");
                write(&meta, &self.metadata().to_string()).await?;
                Ok((ConfigDelivery::SharedDir(share), None))
            }
        }
    }
}

impl ConfigPayload {
    /// OpenStack-style `meta_data.json` for the config drive
    fn metadata(&self) -> Value {
        let keys: Map<String, Value> = self
            .public_keys
            .iter()
            .enumerate()
            .map(|(i, k)| (format!("vmfabric-{}", i), Value::String(k.clone())))
            .collect();
        json!({
            "uuid": Uuid::new_v4().to_string(),
            "public_keys": keys,
        })
    }
}

fn add_ignition_key(doc: &mut Value, user: &str, key: &str) -> Result<()> {
    let invalid =
        |what: &str| Error::Configuration(format!("ignition payload: {} has the wrong type", what));

    let root = doc.as_object_mut().ok_or_else(|| invalid("document"))?;
    let users = root
        .entry("passwd")
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| invalid("passwd"))?
        .entry("users")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| invalid("passwd.users"))?;

    let pos = users
        .iter()
        .position(|u| u.get("name").and_then(Value::as_str) == Some(user));
    let entry = match pos {
        Some(i) => &mut users[i],
        None => {
            users.push(json!({ "name": user }));
            let last = users.len() - 1;
            &mut users[last]
        }
    };
    let keys = entry
        .as_object_mut()
        .ok_or_else(|| invalid("passwd.users entry"))?
        .entry("sshAuthorizedKeys")
        .or_insert_with(|| json!([]))
        .as_array_mut()
        .ok_or_else(|| invalid("sshAuthorizedKeys"))?;
    if !keys.iter().any(|k| k.as_str() == Some(key)) {
        keys.push(Value::String(key.to_string()));
    }
    Ok(())
}

async fn write(path: &Path, data: &str) -> Result<()> {
    tokio::fs::write(path, data)
        .await
        .resource(format_args!("writing {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Firmware,
    SharedDir,
    Offline,
}

/// Guests without a firmware channel always get the payload on disk;
/// the rest get it the way the payload is encoded.
pub fn delivery_for(guest: Arch, encoding: PayloadEncoding) -> Delivery {
    if !guest.has_fw_cfg() {
        return Delivery::Offline;
    }
    match encoding {
        PayloadEncoding::Firmware => Delivery::Firmware,
        PayloadEncoding::Filesystem => Delivery::SharedDir,
    }
}
