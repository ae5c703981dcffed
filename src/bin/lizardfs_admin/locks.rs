use anyhow::Error;

use proxmox_schema::api;

use lfs_api_types::{lock_op, LockTable};
use lfs_protocol::{cltoma, matocl, Message};
use lizardfs::ServerConnection;

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
            inode: {
                type: u32,
                optional: true,
                description: "List only locks of this inode.",
            },
            pending: {
                type: bool,
                optional: true,
                default: false,
                description: "List pending lock requests instead of granted locks.",
            },
        }
    }
)]
/// List file locks held or requested across the installation.
pub async fn manage_locks(
    host: String,
    port: u16,
    porcelain: bool,
    inode: Option<u32>,
    pending: bool,
) -> Result<(), Error> {
    let mut connection = ServerConnection::connect(&host, port).await?;
    let request = match inode {
        Some(inode) => cltoma::ManageLocksList::Inode {
            inode,
            table: LockTable::Posix,
            pending,
            start: 0,
            max: cltoma::MANAGE_LOCKS_LIST_LIMIT,
        },
        None => cltoma::ManageLocksList::All {
            table: LockTable::Posix,
            pending,
            start: 0,
            max: cltoma::MANAGE_LOCKS_LIST_LIMIT,
        },
    };
    let reply = connection
        .send_and_receive(request.to_packet(), matocl::MATOCL_MANAGE_LOCKS_LIST)
        .await?;
    let locks = matocl::ManageLocksListReply::from_packet(&reply)?.locks;

    if !porcelain {
        println!("Inode\tOwner\tSession\tType\tRange");
    }
    for lock in locks {
        let lock_type = if lock.lock_type & lock_op::EXCLUSIVE != 0 {
            "exclusive"
        } else {
            "shared"
        };
        if porcelain {
            println!(
                "{} {} {} {} {} {}",
                lock.inode, lock.owner, lock.session_id, lock_type, lock.start, lock.end
            );
        } else {
            println!(
                "{}\t{}\t{}\t{}\t[{}, {})",
                lock.inode, lock.owner, lock.session_id, lock_type, lock.start, lock.end
            );
        }
    }
    Ok(())
}
