use proxmox_router::cli::*;

mod lizardfs_admin;
use lizardfs_admin::{chunks, locks, status};

fn main() {
    init_cli_logger("LIZARDFS_LOG", "info");

    let cmd_def = CliCommandMap::new()
        .insert(
            "info",
            CliCommand::new(&status::API_METHOD_INFO).arg_param(&["host", "port"]),
        )
        .insert(
            "list-chunkservers",
            CliCommand::new(&chunks::API_METHOD_LIST_CHUNKSERVERS).arg_param(&["host", "port"]),
        )
        .insert(
            "chunks-health",
            CliCommand::new(&chunks::API_METHOD_CHUNKS_HEALTH).arg_param(&["host", "port"]),
        )
        .insert(
            "list-goals",
            CliCommand::new(&chunks::API_METHOD_LIST_GOALS).arg_param(&["host", "port"]),
        )
        .insert(
            "metadataserver-status",
            CliCommand::new(&status::API_METHOD_METADATASERVER_STATUS)
                .arg_param(&["host", "port"]),
        )
        .insert(
            "manage-locks",
            CliCommand::new(&locks::API_METHOD_MANAGE_LOCKS).arg_param(&["host", "port"]),
        )
        .insert(
            "save-metadata",
            CliCommand::new(&status::API_METHOD_SAVE_METADATA).arg_param(&["host", "port"]),
        )
        .insert(
            "reload-config",
            CliCommand::new(&status::API_METHOD_RELOAD_CONFIG).arg_param(&["host", "port"]),
        );

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| proxmox_async::runtime::main(future)),
    );
}
