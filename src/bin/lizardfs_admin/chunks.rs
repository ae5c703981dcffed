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
/// Print information about all connected chunkservers.
pub async fn list_chunkservers(host: String, port: u16, porcelain: bool) -> Result<(), Error> {
    let mut connection = ServerConnection::connect(&host, port).await?;
    let request = cltoma::CservList {};
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_CSERV_LIST)
        .await?;
    let servers = matocl::CservListReply::from_packet(&reply)?.servers;

    for server in servers {
        if porcelain {
            println!(
                "{} {} {} {} {} {} {}",
                server.address,
                format_version(server.version),
                server.chunks,
                server.used_space,
                server.total_space,
                server.error_counter,
                server.label,
            );
        } else {
            println!("Server {}:", server.address);
            println!("\tversion: {}", format_version(server.version));
            println!("\tlabel: {}", server.label);
            println!("\tchunks: {}", server.chunks);
            println!(
                "\tused space: {}B / {}B",
                format_iec(server.used_space),
                format_iec(server.total_space)
            );
            println!("\terrors: {}", server.error_counter);
        }
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
            availability: {
                type: bool,
                optional: true,
                default: false,
                description: "Print only the chunk availability report.",
            },
            replication: {
                type: bool,
                optional: true,
                default: false,
                description: "Print only the replication report.",
            },
        }
    }
)]
/// Print chunk health reports for the installation.
pub async fn chunks_health(
    host: String,
    port: u16,
    porcelain: bool,
    availability: bool,
    replication: bool,
) -> Result<(), Error> {
    let mut connection = ServerConnection::connect(&host, port).await?;

    let request = cltoma::ListGoals {};
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_LIST_GOALS)
        .await?;
    let goals = matocl::ListGoalsReply::from_packet(&reply)?.goals;
    let goal_name = |goal_id: u8| {
        goals
            .iter()
            .find(|goal| goal.id == goal_id)
            .map(|goal| goal.name.clone())
            .unwrap_or_else(|| goal_id.to_string())
    };

    let request = cltoma::ChunksHealth {
        regular_only: false,
    };
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_CHUNKS_HEALTH)
        .await?;
    let health = matocl::ChunksHealthReply::from_packet(&reply)?;

    let show_all = !availability && !replication;

    if show_all || availability {
        if porcelain {
            for row in &health.availability {
                println!(
                    "AVA {} {} {} {}",
                    goal_name(row.goal_id),
                    row.safe,
                    row.endangered,
                    row.lost
                );
            }
        } else {
            println!("Chunks availability state:");
            println!("\tGoal\tSafe\tUnsafe\tLost");
            for row in &health.availability {
                if row.safe + row.endangered + row.lost == 0 {
                    continue;
                }
                println!(
                    "\t{}\t{}\t{}\t{}",
                    goal_name(row.goal_id),
                    row.safe,
                    row.endangered,
                    row.lost
                );
            }
        }
    }

    if show_all || replication {
        if porcelain {
            for row in &health.replication {
                println!(
                    "REP {} {} {}",
                    goal_name(row.goal_id),
                    row.to_replicate,
                    row.to_delete
                );
            }
        } else {
            println!("Chunks replication state:");
            println!("\tGoal\tReplicate\tDelete");
            for row in &health.replication {
                if row.to_replicate + row.to_delete == 0 {
                    continue;
                }
                println!(
                    "\t{}\t{}\t{}",
                    goal_name(row.goal_id),
                    row.to_replicate,
                    row.to_delete
                );
            }
        }
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
/// List the goal definitions the master serves.
pub async fn list_goals(host: String, port: u16, porcelain: bool) -> Result<(), Error> {
    let mut connection = ServerConnection::connect(&host, port).await?;
    let request = cltoma::ListGoals {};
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_LIST_GOALS)
        .await?;
    let goals = matocl::ListGoalsReply::from_packet(&reply)?.goals;

    if porcelain {
        for goal in goals {
            println!("{} {} {}", goal.id, goal.name, goal.definition);
        }
    } else {
        println!("Goal definitions:");
        println!("\tId\tName\tDefinition");
        for goal in goals {
            println!("\t{}\t{}\t{}", goal.id, goal.name, goal.definition);
        }
    }
    Ok(())
}
