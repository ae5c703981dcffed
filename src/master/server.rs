//! The master's TCP front end.
//!
//! Every connection (client mount, chunkserver or admin tool) speaks the
//! same packet framing; the dispatcher keys on the packet type. Metadata is
//! conceptually single-writer: all mutation goes through the registry and
//! lock-manager mutexes, held only for the duration of a handler, never
//! across an await. A malformed packet is fatal for its connection; the
//! offense is logged and the socket closed, the master itself carries on.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use lfs_api_types::{PosixAcl, RichAcl, StatusCode};
use lfs_protocol::packet::Message;
use lfs_protocol::{cltoma, cstoma, matocl, Packet, PacketCodec};

use super::chunk_registry::{ChunkRegistry, ChunkserverState};
use super::config::MasterConfig;
use super::file_locks::{FileLockManager, SetLockOutcome};

#[derive(Default)]
struct InodeAcl {
    posix: Option<PosixAcl>,
    rich: Option<RichAcl>,
    default_posix: Option<PosixAcl>,
}

pub struct MasterState {
    config: Mutex<MasterConfig>,
    config_path: Option<PathBuf>,
    registry: Mutex<ChunkRegistry>,
    locks: Mutex<FileLockManager>,
    acls: Mutex<std::collections::HashMap<u32, InodeAcl>>,
    next_session_id: AtomicU32,
}

impl MasterState {
    pub fn new(config: MasterConfig, config_path: Option<PathBuf>) -> Arc<Self> {
        let registry = ChunkRegistry::new(config.lock_timeout, config.default_goal);
        Arc::new(MasterState {
            config: Mutex::new(config),
            config_path,
            registry: Mutex::new(registry),
            locks: Mutex::new(FileLockManager::new()),
            acls: Mutex::new(std::collections::HashMap::new()),
            next_session_id: AtomicU32::new(1),
        })
    }

    pub fn registry(&self) -> &Mutex<ChunkRegistry> {
        &self.registry
    }
}

pub struct MasterServer {
    state: Arc<MasterState>,
    listener: TcpListener,
}

impl MasterServer {
    /// Bind the configured listen address. The bound address is available
    /// through [MasterServer::local_addr] (useful with an ephemeral port).
    pub async fn bind(state: Arc<MasterState>) -> Result<Self, Error> {
        let listen = state.config.lock().unwrap().listen;
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding master listener on {}", listen))?;
        Ok(MasterServer { state, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), Error> {
        log::info!(
            "master listening on {}",
            self.listener.local_addr()?
        );
        loop {
            let (stream, peer) = self.listener.accept().await?;
            let state = self.state.clone();
            tokio::spawn(async move {
                let session_id = state.next_session_id.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = serve_connection(state.clone(), stream, session_id).await {
                    log::info!("connection from {} closed: {:#}", peer, err);
                }
                state.locks.lock().unwrap().drop_session(session_id);
            });
        }
    }
}

async fn serve_connection(
    state: Arc<MasterState>,
    stream: TcpStream,
    session_id: u32,
) -> Result<(), Error> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, PacketCodec);

    while let Some(packet) = framed.next().await {
        let packet = packet?;
        let reply = dispatch(&state, session_id, packet).await?;
        if let Some(reply) = reply {
            framed.send(reply).await?;
        }
    }
    Ok(())
}

async fn dispatch(
    state: &Arc<MasterState>,
    session_id: u32,
    packet: Packet,
) -> Result<Option<Packet>, Error> {
    let reply = match packet.ptype {
        cltoma::CLTOMA_FUSE_READ_CHUNK => {
            let request = cltoma::FuseReadChunk::from_packet(&packet)?;
            let result = state
                .registry
                .lock()
                .unwrap()
                .read_chunk(request.inode, request.chunk_index);
            let reply = match result {
                Ok((file_length, chunk_id, chunk_version, locations)) => {
                    matocl::FuseReadChunkReply::Response {
                        message_id: request.message_id,
                        file_length,
                        chunk_id,
                        chunk_version,
                        locations,
                    }
                }
                Err(err) => matocl::FuseReadChunkReply::Status {
                    message_id: request.message_id,
                    status: err.status(),
                },
            };
            Some(reply.to_packet())
        }

        cltoma::CLTOMA_FUSE_WRITE_CHUNK => {
            let request = cltoma::FuseWriteChunk::from_packet(&packet)?;
            let result = {
                let mut registry = state.registry.lock().unwrap();
                registry.purge_expired_locks();
                registry.write_chunk(request.inode, request.chunk_index, request.lock_id)
            };
            let reply = match result {
                Ok(lease) => matocl::FuseWriteChunkReply::Response {
                    message_id: request.message_id,
                    file_length: lease.file_length,
                    chunk_id: lease.chunk_id,
                    chunk_version: lease.chunk_version,
                    lock_id: lease.lock_id,
                    locations: lease.locations,
                },
                Err(err) => matocl::FuseWriteChunkReply::Status {
                    message_id: request.message_id,
                    status: err.status(),
                },
            };
            Some(reply.to_packet())
        }

        cltoma::CLTOMA_FUSE_WRITE_CHUNK_END => {
            let request = cltoma::FuseWriteChunkEnd::from_packet(&packet)?;
            let status = match state.registry.lock().unwrap().write_chunk_end(
                request.chunk_id,
                request.lock_id,
                request.inode,
                request.file_length,
            ) {
                Ok(()) => StatusCode::Ok,
                Err(err) => err.status(),
            };
            Some(
                matocl::FuseWriteChunkEndReply {
                    message_id: request.message_id,
                    status,
                }
                .to_packet(),
            )
        }

        cltoma::CLTOMA_FUSE_SETLK => {
            let request = cltoma::FuseSetlk::from_packet(&packet)?;
            let outcome = state.locks.lock().unwrap().set_lock(
                request.inode,
                request.owner,
                session_id,
                request.request_id,
                request.lock,
            );
            let status = match outcome {
                SetLockOutcome::Done => StatusCode::Ok,
                SetLockOutcome::WouldBlock => StatusCode::TryAgain,
                // block this connection until granted or interrupted; the
                // lock manager mutex is not held while waiting
                SetLockOutcome::Queued(receiver) => {
                    receiver.await.unwrap_or(StatusCode::Interrupted)
                }
            };
            Some(
                matocl::FuseSetlkReply {
                    message_id: request.message_id,
                    status,
                }
                .to_packet(),
            )
        }

        cltoma::CLTOMA_FUSE_GETLK => {
            let request = cltoma::FuseGetlk::from_packet(&packet)?;
            let conflict = state.locks.lock().unwrap().get_lock(
                request.inode,
                request.owner,
                session_id,
                request.lock,
            );
            let lock = conflict.unwrap_or(lfs_api_types::FlockWrapper {
                l_type: lfs_api_types::lock_op::UNLOCK,
                ..Default::default()
            });
            Some(
                matocl::FuseGetlkReply {
                    message_id: request.message_id,
                    status: StatusCode::Ok,
                    lock,
                }
                .to_packet(),
            )
        }

        cltoma::CLTOMA_FUSE_SETLK_INTERRUPT => {
            let request = cltoma::FuseSetlkInterrupt::from_packet(&packet)?;
            let found = state.locks.lock().unwrap().interrupt(request.interrupt);
            let status = if found {
                StatusCode::Ok
            } else {
                StatusCode::NoSuchInode
            };
            Some(
                matocl::FuseSetlkReply {
                    message_id: request.message_id,
                    status,
                }
                .to_packet(),
            )
        }

        cltoma::CLTOMA_MANAGE_LOCKS_LIST => {
            let request = cltoma::ManageLocksList::from_packet(&packet)?;
            let locks = state.locks.lock().unwrap();
            let rows = match request {
                cltoma::ManageLocksList::All {
                    table,
                    pending,
                    start,
                    max,
                } => locks.list(
                    None,
                    table,
                    pending,
                    start,
                    max.min(cltoma::MANAGE_LOCKS_LIST_LIMIT),
                ),
                cltoma::ManageLocksList::Inode {
                    inode,
                    table,
                    pending,
                    start,
                    max,
                } => locks.list(
                    Some(inode),
                    table,
                    pending,
                    start,
                    max.min(cltoma::MANAGE_LOCKS_LIST_LIMIT),
                ),
            };
            Some(matocl::ManageLocksListReply { locks: rows }.to_packet())
        }

        cltoma::CLTOMA_FUSE_GET_ACL => {
            let request = cltoma::FuseGetAcl::from_packet(&packet)?;
            Some(get_acl(state, request))
        }

        cltoma::CLTOMA_FUSE_SET_ACL => {
            let request = cltoma::FuseSetAcl::from_packet(&packet)?;
            Some(set_acl(state, request))
        }

        cltoma::CLTOMA_INFO => {
            cltoma::Info::from_packet(&packet)?;
            let info = state.registry.lock().unwrap().info();
            Some(matocl::InfoReply { info }.to_packet())
        }

        cltoma::CLTOMA_CSERV_LIST => {
            cltoma::CservList::from_packet(&packet)?;
            let servers = state.registry.lock().unwrap().chunkserver_list();
            Some(matocl::CservListReply { servers }.to_packet())
        }

        cltoma::CLTOMA_CHUNKS_HEALTH => {
            let request = cltoma::ChunksHealth::from_packet(&packet)?;
            let goals = state.config.lock().unwrap().goals.clone();
            let (availability, replication) =
                state.registry.lock().unwrap().chunks_health(&goals);
            Some(
                matocl::ChunksHealthReply {
                    regular_only: request.regular_only,
                    availability,
                    replication,
                }
                .to_packet(),
            )
        }

        cltoma::CLTOMA_LIST_GOALS => {
            cltoma::ListGoals::from_packet(&packet)?;
            let goals = state.config.lock().unwrap().goals.clone();
            let goals = state.registry.lock().unwrap().goal_list(&goals);
            Some(matocl::ListGoalsReply { goals }.to_packet())
        }

        cltoma::CLTOMA_METADATASERVER_STATUS => {
            let request = cltoma::MetadataserverStatus::from_packet(&packet)?;
            let metadata_version = state.registry.lock().unwrap().metadata_version();
            Some(
                matocl::MetadataserverStatusReply {
                    message_id: request.message_id,
                    status: matocl::METADATASERVER_STATUS_MASTER,
                    metadata_version,
                }
                .to_packet(),
            )
        }

        cltoma::CLTOMA_SAVE_METADATA => {
            let request = cltoma::SaveMetadata::from_packet(&packet)?;
            let status = match save_metadata(state) {
                Ok(()) => StatusCode::Ok,
                Err(err) => {
                    log::error!("saving metadata failed: {:#}", err);
                    StatusCode::Io
                }
            };
            Some(
                matocl::SaveMetadataReply {
                    message_id: request.message_id,
                    status,
                }
                .to_packet(),
            )
        }

        cltoma::CLTOMA_RELOAD_CONFIG => {
            let request = cltoma::ReloadConfig::from_packet(&packet)?;
            let status = match reload_config(state) {
                Ok(()) => StatusCode::Ok,
                Err(err) => {
                    log::error!("reloading config failed: {:#}", err);
                    StatusCode::Io
                }
            };
            Some(
                matocl::ReloadConfigReply {
                    message_id: request.message_id,
                    status,
                }
                .to_packet(),
            )
        }

        cstoma::CSTOMA_REGISTER => {
            let request = cstoma::Register::from_packet(&packet)?;
            state
                .registry
                .lock()
                .unwrap()
                .register_chunkserver(ChunkserverState {
                    address: request.address,
                    label: request.label,
                    version: request.server_version,
                    used_space: request.used_space,
                    total_space: request.total_space,
                    chunks: 0,
                    error_counter: 0,
                });
            Some(
                cstoma::RegisterAck {
                    status: StatusCode::Ok,
                }
                .to_packet(),
            )
        }

        cstoma::CSTOMA_REGISTER_PARTS => {
            let request = cstoma::RegisterParts::from_packet(&packet)?;
            let status = match state
                .registry
                .lock()
                .unwrap()
                .register_parts(request.address, &request.parts)
            {
                Ok(()) => StatusCode::Ok,
                Err(err) => err.status(),
            };
            Some(cstoma::RegisterAck { status }.to_packet())
        }

        cstoma::CSTOMA_SPACE => {
            let request = cstoma::Space::from_packet(&packet)?;
            state.registry.lock().unwrap().update_space(
                request.address,
                request.used_space,
                request.total_space,
            );
            None
        }

        other => {
            // a structural offense: log it and drop the connection
            anyhow::bail!("unknown packet type {:#06x}", other);
        }
    };

    Ok(reply)
}

fn get_acl(state: &Arc<MasterState>, request: cltoma::FuseGetAcl) -> Packet {
    let acls = state.acls.lock().unwrap();
    let stored = acls.get(&request.inode);

    let reply = match request.acl_type {
        cltoma::ACL_TYPE_POSIX => {
            let posix = stored.and_then(|acl| {
                acl.posix
                    .clone()
                    .or_else(|| acl.rich.as_ref().and_then(RichAcl::to_posix_acl))
            });
            match posix {
                Some(acl) => matocl::FuseGetAclReply::Posix {
                    message_id: request.message_id,
                    acl: acl.to_string(),
                },
                None => matocl::FuseGetAclReply::Status {
                    message_id: request.message_id,
                    status: StatusCode::NoSuchInode,
                },
            }
        }
        cltoma::ACL_TYPE_RICH => {
            let rich = stored.and_then(|acl| {
                acl.rich.clone().or_else(|| {
                    acl.posix.as_ref().map(|posix| {
                        let mut rich = RichAcl::new();
                        rich.append_posix_acl(posix, false);
                        rich
                    })
                })
            });
            match rich {
                Some(acl) => matocl::FuseGetAclReply::Rich {
                    message_id: request.message_id,
                    acl: acl.to_string(),
                },
                None => matocl::FuseGetAclReply::Status {
                    message_id: request.message_id,
                    status: StatusCode::NoSuchInode,
                },
            }
        }
        cltoma::ACL_TYPE_DEFAULT_POSIX => match stored.and_then(|acl| acl.default_posix.clone()) {
            Some(acl) => matocl::FuseGetAclReply::Posix {
                message_id: request.message_id,
                acl: acl.to_string(),
            },
            None => matocl::FuseGetAclReply::Status {
                message_id: request.message_id,
                status: StatusCode::NoSuchInode,
            },
        },
        _ => matocl::FuseGetAclReply::Status {
            message_id: request.message_id,
            status: StatusCode::BadRequest,
        },
    };
    reply.to_packet()
}

fn set_acl(state: &Arc<MasterState>, request: cltoma::FuseSetAcl) -> Packet {
    let mut acls = state.acls.lock().unwrap();
    let (message_id, status) = match request {
        cltoma::FuseSetAcl::Posix {
            message_id,
            inode,
            acl,
            ..
        } => match acl.parse::<PosixAcl>() {
            Ok(parsed) => {
                let entry = acls.entry(inode).or_default();
                entry.posix = Some(parsed);
                entry.rich = None;
                (message_id, StatusCode::Ok)
            }
            Err(_) => (message_id, StatusCode::BadRequest),
        },
        cltoma::FuseSetAcl::Rich {
            message_id,
            inode,
            acl,
            ..
        } => match acl.parse::<RichAcl>() {
            Ok(parsed) => {
                let entry = acls.entry(inode).or_default();
                entry.default_posix = parsed.to_default_posix_acl();
                entry.rich = Some(parsed);
                entry.posix = None;
                (message_id, StatusCode::Ok)
            }
            Err(_) => (message_id, StatusCode::BadRequest),
        },
    };
    matocl::FuseSetAclReply { message_id, status }.to_packet()
}

fn save_metadata(state: &Arc<MasterState>) -> Result<(), Error> {
    let path = state.config.lock().unwrap().data_path.join("metadata.mfs");
    let snapshot = state.registry.lock().unwrap().snapshot();
    let text = serde_json::to_vec_pretty(&snapshot)?;
    // write-then-rename keeps the previous snapshot intact on failure
    let tmp_path = path.with_extension("mfs.tmp");
    std::fs::write(&tmp_path, text)
        .with_context(|| format!("writing metadata snapshot {:?}", tmp_path))?;
    std::fs::rename(&tmp_path, &path)
        .with_context(|| format!("renaming metadata snapshot into {:?}", path))?;
    log::info!("metadata snapshot saved to {:?}", path);
    Ok(())
}

fn reload_config(state: &Arc<MasterState>) -> Result<(), Error> {
    let path = match &state.config_path {
        Some(path) => path.clone(),
        None => anyhow::bail!("master started without a config file"),
    };
    let fresh = MasterConfig::load(&path)?;
    let mut config = state.config.lock().unwrap();
    log::info!(
        "config reloaded from {:?}: {} goals",
        path,
        fresh.goals.len()
    );
    config.goals = fresh.goals;
    config.default_goal = fresh.default_goal;
    config.lock_timeout = fresh.lock_timeout;
    Ok(())
}
