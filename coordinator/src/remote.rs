// Copyright 2025 Oxide Computer Company

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use slog::{debug, o, Logger};
use url::Url;

use sxm_common::SxmError;

use crate::storage::{
    AttachInfo, MirrorReceiveResult, SrInfo, StorageApi, VdiInfo,
};

/// Builds a storage-API client bound to a destination host.  A fresh
/// client is constructed per call site so `verify_dest` always reflects
/// the caller's setting.
pub trait RemoteFactory: Sync + Send {
    fn connect(
        &self,
        url: &str,
        verify_dest: bool,
    ) -> Result<Arc<dyn StorageApi>, SxmError>;
}

pub struct HttpRemoteFactory {
    log: Logger,
}

impl HttpRemoteFactory {
    pub fn new(log: Logger) -> HttpRemoteFactory {
        HttpRemoteFactory { log }
    }
}

impl RemoteFactory for HttpRemoteFactory {
    fn connect(
        &self,
        url: &str,
        verify_dest: bool,
    ) -> Result<Arc<dyn StorageApi>, SxmError> {
        Ok(Arc::new(RpcClient::new(
            self.log.new(o!("remote" => url.to_string())),
            url,
            verify_dest,
        )?))
    }
}

/// Blocking JSON-RPC client for the remote storage API, one request per
/// operation against `{url}/services/SM`.
pub struct RpcClient {
    log: Logger,
    endpoint: Url,
    client: reqwest::blocking::Client,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcFault>,
}

#[derive(Deserialize)]
struct RpcFault {
    code: String,
    #[serde(default)]
    params: Vec<String>,
}

impl RpcClient {
    pub fn new(
        log: Logger,
        url: &str,
        verify_dest: bool,
    ) -> Result<RpcClient, SxmError> {
        let base = Url::parse(url).map_err(|e| {
            SxmError::InternalError(format!("parse url {}: {}", url, e))
        })?;
        let endpoint = base.join("services/SM").map_err(|e| {
            SxmError::InternalError(format!("join url {}: {}", url, e))
        })?;

        // Storage operations (attach, scan of a large SR) can take a long
        // time; only connection establishment is bounded.
        let client = reqwest::blocking::ClientBuilder::new()
            .connect_timeout(Duration::from_secs(10))
            .timeout(None)
            .danger_accept_invalid_certs(!verify_dest)
            .build()
            .map_err(|e| SxmError::InternalError(e.to_string()))?;

        Ok(RpcClient {
            log,
            endpoint,
            client,
        })
    }

    fn call<T>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, SxmError>
    where
        T: DeserializeOwned,
    {
        debug!(self.log, "rpc {}", method);
        let body = json!({
            "method": method,
            "params": [params],
            "id": 1,
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .map_err(|e| {
                SxmError::InternalError(format!("rpc {}: {}", method, e))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SxmError::InternalError(format!(
                "rpc {}: http status {}",
                method, status
            )));
        }

        let decoded: RpcResponse = response.json().map_err(|e| {
            SxmError::InternalError(format!("rpc {}: {}", method, e))
        })?;
        rpc_result(decoded)
    }
}

fn rpc_result<T>(decoded: RpcResponse) -> Result<T, SxmError>
where
    T: DeserializeOwned,
{
    if let Some(fault) = decoded.error {
        return Err(SxmError::BackendError {
            code: fault.code,
            params: fault.params,
        });
    }
    let result = decoded.result.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(result).map_err(|e| {
        SxmError::InternalError(format!("rpc result decode: {}", e))
    })
}

impl StorageApi for RpcClient {
    fn sr_list(&self) -> Result<Vec<String>, SxmError> {
        self.call("SR.list", json!({}))
    }

    fn sr_scan(&self, sr: &str) -> Result<Vec<VdiInfo>, SxmError> {
        self.call("SR.scan", json!({ "sr": sr }))
    }

    fn sr_scan2(&self, sr: &str) -> Result<(Vec<VdiInfo>, SrInfo), SxmError> {
        self.call("SR.scan2", json!({ "sr": sr }))
    }

    fn sr_update_snapshot_info_dest(
        &self,
        sr: &str,
        vdi: &str,
        src_vdi: &VdiInfo,
        snapshot_pairs: &[(String, VdiInfo)],
    ) -> Result<(), SxmError> {
        self.call(
            "SR.update_snapshot_info_dest",
            json!({
                "sr": sr,
                "vdi": vdi,
                "src_vdi": src_vdi,
                "snapshot_pairs": snapshot_pairs,
            }),
        )
    }

    fn vdi_create(&self, sr: &str, info: &VdiInfo) -> Result<VdiInfo, SxmError> {
        self.call("VDI.create", json!({ "sr": sr, "vdi_info": info }))
    }

    fn vdi_clone(&self, sr: &str, info: &VdiInfo) -> Result<VdiInfo, SxmError> {
        self.call("VDI.clone", json!({ "sr": sr, "vdi_info": info }))
    }

    fn vdi_snapshot(
        &self,
        sr: &str,
        info: &VdiInfo,
    ) -> Result<VdiInfo, SxmError> {
        self.call("VDI.snapshot", json!({ "sr": sr, "vdi_info": info }))
    }

    fn vdi_destroy(&self, sr: &str, vdi: &str) -> Result<(), SxmError> {
        self.call("VDI.destroy", json!({ "sr": sr, "vdi": vdi }))
    }

    fn vdi_resize(
        &self,
        sr: &str,
        vdi: &str,
        new_size: u64,
    ) -> Result<u64, SxmError> {
        self.call(
            "VDI.resize",
            json!({ "sr": sr, "vdi": vdi, "new_size": new_size }),
        )
    }

    fn vdi_attach3(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
        read_write: bool,
    ) -> Result<AttachInfo, SxmError> {
        self.call(
            "VDI.attach3",
            json!({
                "dp": dp,
                "sr": sr,
                "vdi": vdi,
                "vm": vm,
                "read_write": read_write,
            }),
        )
    }

    fn vdi_activate3(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError> {
        self.call(
            "VDI.activate3",
            json!({ "dp": dp, "sr": sr, "vdi": vdi, "vm": vm }),
        )
    }

    fn vdi_deactivate(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError> {
        self.call(
            "VDI.deactivate",
            json!({ "dp": dp, "sr": sr, "vdi": vdi, "vm": vm }),
        )
    }

    fn vdi_detach(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError> {
        self.call(
            "VDI.detach",
            json!({ "dp": dp, "sr": sr, "vdi": vdi, "vm": vm }),
        )
    }

    fn vdi_set_content_id(
        &self,
        sr: &str,
        vdi: &str,
        content_id: &str,
    ) -> Result<(), SxmError> {
        self.call(
            "VDI.set_content_id",
            json!({ "sr": sr, "vdi": vdi, "content_id": content_id }),
        )
    }

    fn vdi_similar_content(
        &self,
        sr: &str,
        vdi: &str,
    ) -> Result<Vec<VdiInfo>, SxmError> {
        self.call("VDI.similar_content", json!({ "sr": sr, "vdi": vdi }))
    }

    fn vdi_compose(
        &self,
        sr: &str,
        vdi1: &str,
        vdi2: &str,
    ) -> Result<(), SxmError> {
        self.call(
            "VDI.compose",
            json!({ "sr": sr, "vdi1": vdi1, "vdi2": vdi2 }),
        )
    }

    fn dp_create(&self, id: &str) -> Result<String, SxmError> {
        self.call("DP.create", json!({ "id": id }))
    }

    fn dp_attach_info(
        &self,
        sr: &str,
        vdi: &str,
        dp: &str,
        vm: &str,
    ) -> Result<AttachInfo, SxmError> {
        self.call(
            "DP.attach_info",
            json!({ "sr": sr, "vdi": vdi, "dp": dp, "vm": vm }),
        )
    }

    fn dp_destroy(&self, dp: &str, allow_leak: bool) -> Result<(), SxmError> {
        self.call(
            "DP.destroy",
            json!({ "dp": dp, "allow_leak": allow_leak }),
        )
    }

    fn mirror_receive_start2(
        &self,
        sr: &str,
        vdi_info: &VdiInfo,
        id: &str,
        similars: &[String],
        vm: &str,
    ) -> Result<MirrorReceiveResult, SxmError> {
        self.call(
            "DATA.MIRROR.receive_start2",
            json!({
                "sr": sr,
                "vdi_info": vdi_info,
                "id": id,
                "similar": similars,
                "vm": vm,
            }),
        )
    }

    fn mirror_receive_cancel(&self, id: &str) -> Result<(), SxmError> {
        self.call("DATA.MIRROR.receive_cancel", json!({ "id": id }))
    }

    fn mirror_receive_finalize(&self, id: &str) -> Result<(), SxmError> {
        self.call("DATA.MIRROR.receive_finalize", json!({ "id": id }))
    }

    fn mirror_import_activate(
        &self,
        sr: &str,
        vdi: &str,
        dp: &str,
        vm: &str,
    ) -> Result<String, SxmError> {
        self.call(
            "DATA.MIRROR.import_activate",
            json!({ "sr": sr, "vdi": vdi, "dp": dp, "vm": vm }),
        )
    }
}

/// Establishes the mirror NBD channel to the destination and hands back
/// the connected socket, ready to be donated to tap-disk.
pub trait NbdConnector: Sync + Send {
    fn handshake(&self, url: &Url) -> Result<std::os::fd::OwnedFd, SxmError>;
}

pub struct HttpNbdConnector;

impl NbdConnector for HttpNbdConnector {
    fn handshake(&self, url: &Url) -> Result<std::os::fd::OwnedFd, SxmError> {
        Ok(nbd_handshake(url)?.into())
    }
}

/// Perform the HTTP handshake for the mirror NBD channel ourselves, so the
/// underlying socket can be donated to tap-disk afterwards.  Speaks
/// HTTP/1.0 directly on a TCP stream; once the 200 arrives the stream
/// carries nothing but NBD traffic.
pub fn nbd_handshake(url: &Url) -> Result<TcpStream, SxmError> {
    let host = url.host_str().ok_or_else(|| {
        SxmError::InternalError(format!("no host in {}", url))
    })?;
    let port = url.port_or_known_default().unwrap_or(80);

    let mut stream =
        TcpStream::connect((host, port)).map_err(|e| {
            SxmError::InternalError(format!(
                "connect {}:{}: {:?}",
                host, port, e
            ))
        })?;

    let mut target = url.path().to_string();
    if let Some(q) = url.query() {
        target.push('?');
        target.push_str(q);
    }
    let request = format!(
        "PUT {} HTTP/1.0\r\nHost: {}\r\nTransfer-encoding: nbd\r\n\r\n",
        target, host
    );
    stream.write_all(request.as_bytes())?;
    stream.flush()?;

    // Read the response headers only; the body, if any, belongs to the
    // NBD conversation.
    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte)? {
            0 => {
                return Err(SxmError::InternalError(format!(
                    "connection closed during NBD handshake with {}",
                    url
                )))
            }
            _ => response.push(byte[0]),
        }
        if response.len() > 16 * 1024 {
            return Err(SxmError::InternalError(
                "oversized NBD handshake response".to_string(),
            ));
        }
    }

    let header = String::from_utf8_lossy(&response);
    let status_line = header.lines().next().unwrap_or("");
    if !status_line.contains("200") {
        return Err(SxmError::InternalError(format!(
            "NBD handshake with {} refused: {}",
            url, status_line
        )));
    }

    Ok(stream)
}
