use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    protocol::{NICK_COMMAND, ServerLine, command_argument, notices, write_line},
    router::{Route, route},
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (reader, mut writer) = establish_connection(&args).await?;
    if let Some(nickname) = &args.nickname {
        request_nickname(&mut writer, nickname).await?;
    }

    // `Lines` keeps partial lines across loop iterations, so a read that
    // loses a `select!` race drops no bytes.
    let mut server_lines = reader.lines();
    let mut input_lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    run_client_loop(&mut server_lines, &mut writer, &mut input_lines, &mut stdout).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn request_nickname(writer: &mut OwnedWriteHalf, nickname: &str) -> Result<()> {
    write_line(writer, &format!("{NICK_COMMAND} {nickname}")).await?;
    Ok(())
}

async fn run_client_loop<R, W, I, O>(
    server_lines: &mut Lines<R>,
    writer: &mut W,
    input_lines: &mut Lines<I>,
    output: &mut O,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        select! {
            server_line = server_lines.next_line() => {
                if !handle_server_line(server_line, output).await? {
                    break;
                }
            }
            input = input_lines.next_line() => {
                if !handle_input(input, writer, output).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_line<O>(line: io::Result<Option<String>>, output: &mut O) -> Result<bool>
where
    O: AsyncWrite + Unpin,
{
    match line.context("failed to read from relay")? {
        Some(line) => {
            if let Some(rendered) = render(&ServerLine::parse(&line)) {
                write_output(output, &rendered).await?;
            }
            Ok(true)
        }
        None => {
            write_output(output, "*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_input<W, O>(
    input: io::Result<Option<String>>,
    writer: &mut W,
    output: &mut O,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
    O: AsyncWrite + Unpin,
{
    let Some(input) = input.context("failed to read input")? else {
        return Ok(false);
    };

    let text = input.trim_end();
    if text.trim().is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_output(output, "*** leaving chat").await?;
        return Ok(false);
    }

    if let Some(usage) = usage_error(text) {
        write_stderr(&format!("!!! {usage}")).await?;
        return Ok(true);
    }

    write_line(writer, text).await?;
    Ok(true)
}

/// Catches malformed commands before they reach the relay.
fn usage_error(text: &str) -> Option<&'static str> {
    match route(text) {
        Route::Reject { .. } if command_argument(text, NICK_COMMAND).is_some() => {
            Some(notices::NICK_USAGE)
        }
        Route::Reject { notice } => Some(notice),
        _ => None,
    }
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection<W: AsyncWrite + Unpin>(writer: &mut W) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

/// Terminal rendering of a relay line; `None` for lines with nothing to show.
fn render(line: &ServerLine) -> Option<String> {
    match line {
        ServerLine::Users(users) if users.is_empty() => None,
        ServerLine::Users(users) => Some(format!("*** online: {}", users.join(", "))),
        ServerLine::Direct(text) => Some(format!("[Private] {text}")),
        ServerLine::System(text) => Some(format!("[Server] {text}")),
        ServerLine::Chat(text) => Some(text.clone()),
    }
}

async fn write_output<O: AsyncWrite + Unpin>(output: &mut O, line: &str) -> io::Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::protocol::read_line;

    #[tokio::test]
    async fn split_server_line_survives_interleaved_input() {
        let (client_end, relay_end) = tokio::io::duplex(1024);
        let (client_read, mut client_write) = tokio::io::split(client_end);
        let (relay_read, mut relay_write) = tokio::io::split(relay_end);
        let mut relay_read = BufReader::new(relay_read);
        let (mut keyboard, input_end) = tokio::io::duplex(1024);

        let client = tokio::spawn(async move {
            let mut server_lines = BufReader::new(client_read).lines();
            let mut input_lines = BufReader::new(input_end).lines();
            let mut output = Vec::new();
            run_client_loop(
                &mut server_lines,
                &mut client_write,
                &mut input_lines,
                &mut output,
            )
            .await?;
            Ok::<_, anyhow::Error>(output)
        });

        // Half a line reaches the client, then the user types something.
        relay_write.write_all(b"DM b").await.expect("first segment");
        tokio::time::sleep(Duration::from_millis(50)).await;
        keyboard.write_all(b"hello\n").await.expect("typed line");
        let sent = timeout(Duration::from_secs(1), read_line(&mut relay_read))
            .await
            .expect("timed out waiting for typed line")
            .expect("relay read");
        assert_eq!(sent.as_deref(), Some("hello"));

        relay_write.write_all(b"ob: hello\n").await.expect("second segment");
        drop(relay_write);
        drop(relay_read);

        let output = timeout(Duration::from_secs(1), client)
            .await
            .expect("client loop should end")
            .expect("client task")
            .expect("client loop");
        assert_eq!(
            String::from_utf8(output).expect("utf-8 output"),
            "[Private] bob: hello\n*** server closed the connection\n"
        );
        drop(keyboard);
    }

    #[test]
    fn renders_each_line_kind() {
        assert_eq!(
            render(&ServerLine::parse("USERS alice,bob")).as_deref(),
            Some("*** online: alice, bob")
        );
        assert_eq!(render(&ServerLine::parse("USERS ")), None);
        assert_eq!(
            render(&ServerLine::parse("DM bob: secret")).as_deref(),
            Some("[Private] bob: secret")
        );
        assert_eq!(
            render(&ServerLine::parse("SYS alice has joined the chat.")).as_deref(),
            Some("[Server] alice has joined the chat.")
        );
        assert_eq!(
            render(&ServerLine::parse("alice: hi")).as_deref(),
            Some("alice: hi")
        );
    }

    #[test]
    fn malformed_commands_are_caught_locally() {
        assert_eq!(usage_error("/w bob"), Some(notices::WHISPER_USAGE));
        assert_eq!(usage_error("/nick "), Some(notices::NICK_USAGE));
        assert_eq!(usage_error("/nick carol"), None);
        assert_eq!(usage_error("/w bob hi"), None);
        assert_eq!(usage_error("hello"), None);
    }
}
