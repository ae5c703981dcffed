use anyhow::Error;

use proxmox_schema::api;

use lfs_protocol::packet::Message;
use lfs_protocol::{cltoma, matocl};
use lizardfs::ServerConnection;

use super::{format_iec, format_version};

#[api(
    input: {
        properties: {
            host: {
                type: String,
                description: "Master ip address.",
            },
            port: {
                type: u16,
                description: "Master port.",
            },
            porcelain: {
                type: bool,
                optional: true,
                default: false,
                description: "Machine readable, whitespace separated output.",
            },
        }
    }
)]
/// Print statistics concerning the LizardFS installation.
pub async fn info(host: String, port: u16, porcelain: bool) -> Result<(), Error> {
    let mut connection = ServerConnection::connect(&host, port).await?;
    let request = cltoma::Info {};
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_INFO)
        .await?;
    let info = matocl::InfoReply::from_packet(&reply)?.info;

    if porcelain {
        println!(
            "{} {} {} {} {} {} {} {}",
            format_version(info.version),
            info.memory_usage,
            info.total_space,
            info.available_space,
            info.file_nodes,
            info.chunks,
            info.chunk_copies,
            info.regular_copies,
        );
    } else {
        println!("LizardFS v{}", format_version(info.version));
        println!("Memory usage:\t{}B", format_iec(info.memory_usage));
        println!("Total space:\t{}B", format_iec(info.total_space));
        println!("Available space:\t{}B", format_iec(info.available_space));
        println!("Files:\t{}", info.file_nodes);
        println!("Chunks:\t{}", info.chunks);
        println!("Chunk copies:\t{}", info.chunk_copies);
        println!("Regular copies:\t{}", info.regular_copies);
    }
    Ok(())
}

#[api(
    input: {
        properties: {
            host: {
                type: String,
                description: "Master ip address.",
            },
            port: {
                type: u16,
                description: "Master port.",
            },
            porcelain: {
                type: bool,
                optional: true,
                default: false,
                description: "Machine readable, whitespace separated output.",
            },
        }
    }
)]
/// Print the status of the metadata server.
pub async fn metadataserver_status(
    host: String,
    port: u16,
    porcelain: bool,
) -> Result<(), Error> {
    let mut connection = ServerConnection::connect(&host, port).await?;
    let request = cltoma::MetadataserverStatus { message_id: 1 };
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_METADATASERVER_STATUS)
        .await?;
    let reply = matocl::MetadataserverStatusReply::from_packet(&reply)?;

    let (personality, server_status) = match reply.status {
        matocl::METADATASERVER_STATUS_MASTER => ("master", "running"),
        matocl::METADATASERVER_STATUS_SHADOW_CONNECTED => ("shadow", "connected"),
        matocl::METADATASERVER_STATUS_SHADOW_DISCONNECTED => ("shadow", "disconnected"),
        _ => ("<unknown>", "<unknown>"),
    };

    if porcelain {
        println!(
            "{}\t{}\t{}",
            personality, server_status, reply.metadata_version
        );
    } else {
        println!("     personality: {}", personality);
        println!("   server status: {}", server_status);
        println!("metadata version: {}", reply.metadata_version);
    }
    Ok(())
}

#[api(
    input: {
        properties: {
            host: {
                type: String,
                description: "Master ip address.",
            },
            port: {
                type: u16,
                description: "Master port.",
            },
        }
    }
)]
/// Ask the master to write a metadata snapshot to disk.
pub async fn save_metadata(host: String, port: u16) -> Result<(), Error> {
    let mut connection = ServerConnection::connect(&host, port).await?;
    let request = cltoma::SaveMetadata { message_id: 1 };
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_SAVE_METADATA)
        .await?;
    let reply = matocl::SaveMetadataReply::from_packet(&reply)?;
    reply.status.into_result()?;
    println!("Metadata saved");
    Ok(())
}

#[api(
    input: {
        properties: {
            host: {
                type: String,
                description: "Master ip address.",
            },
            port: {
                type: u16,
                description: "Master port.",
            },
        }
    }
)]
/// Ask the master to re-read its configuration file.
pub async fn reload_config(host: String, port: u16) -> Result<(), Error> {
    let mut connection = ServerConnection::connect(&host, port).await?;
    let request = cltoma::ReloadConfig { message_id: 1 };
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_RELOAD_CONFIG)
        .await?;
    let reply = matocl::ReloadConfigReply::from_packet(&reply)?;
    reply.status.into_result()?;
    println!("Configuration reloaded");
    Ok(())
}
