use anyhow::Result;
use clap::{Parser, Subcommand};
use shared::domain::{ChannelKind, Role, ServerId, UserId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    CreateUser {
        username: String,
        #[arg(long)]
        display_name: Option<String>,
    },
    CreateServer {
        owner_user_id: i64,
        name: String,
    },
    AddMember {
        server_id: i64,
        user_id: i64,
        #[arg(long, default_value = "member", value_parser = parse_role)]
        role: Role,
    },
    CreateChannel {
        server_id: i64,
        name: String,
        /// `text` or `voice`.
        #[arg(value_parser = parse_kind)]
        kind: ChannelKind,
    },
    ListChannels {
        server_id: i64,
    },
}

fn parse_kind(raw: &str) -> Result<ChannelKind, String> {
    raw.trim().to_ascii_lowercase().parse()
}

fn parse_role(raw: &str) -> Result<Role, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "admin" => Ok(Role::Admin),
        "member" => Ok(Role::Member),
        other => Err(format!("unknown role '{other}' (expected admin or member)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::CreateUser {
            username,
            display_name,
        } => {
            let user_id = storage.create_user(&username).await?;
            if let Some(display_name) = display_name {
                storage.set_display_name(user_id, &display_name).await?;
            }
            println!("created user_id={}", user_id.0);
        }
        Command::CreateServer {
            owner_user_id,
            name,
        } => {
            let server_id = storage.create_server(&name, UserId(owner_user_id)).await?;
            println!("created server_id={}", server_id.0);
        }
        Command::AddMember {
            server_id,
            user_id,
            role,
        } => {
            storage
                .add_membership(ServerId(server_id), UserId(user_id), role)
                .await?;
            println!("user_id={user_id} joined server_id={server_id} as {}", role.as_str());
        }
        Command::CreateChannel {
            server_id,
            name,
            kind,
        } => {
            let channel_id = storage
                .create_channel(ServerId(server_id), &name, kind)
                .await?;
            println!("created {} channel_id={}", kind.as_str(), channel_id.0);
        }
        Command::ListChannels { server_id } => {
            for channel in storage.list_channels_for_server(ServerId(server_id)).await? {
                println!("{}\t{}\t{}", channel.id.0, channel.kind.as_str(), channel.name);
            }
        }
    }

    Ok(())
}
