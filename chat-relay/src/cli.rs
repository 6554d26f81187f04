use clap::{Args, Parser, Subcommand};

pub const DEFAULT_ADDR: &str = "localhost:5555";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay, accepting TCP connections.
    Server(ServerArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to listen on. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = DEFAULT_ADDR)]
    pub listen: String,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Nickname to request right after connecting. Without it, the first
    /// line typed is used as the nickname.
    #[arg(long)]
    pub nickname: Option<String>,

    /// Address of the relay to connect to.
    #[arg(long, env = "CHAT_RELAY_SERVER", default_value = DEFAULT_ADDR)]
    pub server: String,
}
