use clap::Parser;
use resplex::{Command, Config, Connection, Destination, Error, Value};
use tokio::sync::mpsc;
use tracing::debug;

/// How many pushed frames may wait for the terminal before the connection stalls.
const PUSH_BUFFER: usize = 64;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(flatten)]
    config: Config,

    /// The command to send, e.g. `GET key`. Defaults to `PING`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let args = Args::parse();

    let mut words = args.command.into_iter();
    let command = match words.next() {
        Some(verb) => Command::new(verb).args(words),
        None => Command::new("PING"),
    };

    let connection = Connection::open_with(&args.config).await?;

    match command.name().as_str() {
        "subscribe" | "psubscribe" => {
            let (sink, mut pushed) = mpsc::channel(PUSH_BUFFER);
            connection.subscribe(command, sink).await?;

            // The sink is dropped once nothing is subscribed any more, which ends the loop.
            while let Some(frame) = pushed.recv().await {
                println!("{}", frame);
            }
        }
        _ => match connection.command(command, Destination::Frame).await {
            Ok(Value::Frame(frame)) => println!("{}", frame),
            Ok(value) => println!("{:?}", value),
            Err(Error::Server(message)) => println!("(error) {}", message),
            Err(err) => return Err(err),
        },
    }

    connection.close().await
}
