use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::{
    io::{self, AsyncWriteExt, Stdin},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{
        ClientFrame, FrameReader, Message, ServerFrame, codec_to_io_error, line_reader,
        write_frame,
    },
};

/// What a line typed by the user asks for.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Quit,
    Say(&'a str),
    Whisper { to: &'a str, text: &'a str },
    Usage(&'static str),
}

fn parse_input(line: &str) -> Option<Input<'_>> {
    let text = line.trim_end();
    if text.trim().is_empty() {
        return None;
    }
    if text.eq_ignore_ascii_case("/quit") {
        return Some(Input::Quit);
    }
    if let Some(rest) = text
        .strip_prefix("/msg")
        .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
    {
        let rest = rest.trim_start();
        return Some(match rest.split_once(char::is_whitespace) {
            Some((to, body)) if !body.trim().is_empty() => Input::Whisper {
                to,
                text: body.trim_start(),
            },
            _ => Input::Usage("usage: /msg <id> <text>"),
        });
    }
    Some(Input::Say(text))
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut frames, mut writer) = establish_connection(&args).await?;
    write_frame(&mut writer, &ClientFrame::Hello { id: args.id.clone() }).await?;

    let mut stdin = line_reader(tokio::io::stdin());

    run_client_loop(&mut frames, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(FrameReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((FrameReader::new(reader), writer))
}

async fn run_client_loop(
    frames: &mut FrameReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut FramedRead<Stdin, LinesCodec>,
) -> Result<()> {
    loop {
        select! {
            frame = frames.next_frame::<ServerFrame>() => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            line = stdin.next() => {
                if !handle_stdin_input(line, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_server_frame(frame: io::Result<Option<ServerFrame>>) -> Result<bool> {
    match frame? {
        Some(frame) => {
            write_line_for(frame).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    line: Option<Result<String, LinesCodecError>>,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };
    let input = line.map_err(codec_to_io_error)?;

    let frame = match parse_input(&input) {
        None => return Ok(true),
        Some(Input::Quit) => {
            write_stdout("*** leaving chat").await?;
            return Ok(false);
        }
        Some(Input::Usage(usage)) => {
            write_stderr(usage).await?;
            return Ok(true);
        }
        Some(Input::Say(text)) => ClientFrame::Say {
            text: text.to_string(),
        },
        Some(Input::Whisper { to, text }) => ClientFrame::Whisper {
            to: to.to_string(),
            text: text.to_string(),
        },
    };

    write_frame(writer, &frame).await?;
    Ok(true)
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

fn render_delivery(message: &Message) -> String {
    if message.broadcast {
        format!("<{}> {}", message.sender, message.content)
    } else {
        format!("[private] <{}> {}", message.sender, message.content)
    }
}

async fn write_line_for(frame: ServerFrame) -> io::Result<()> {
    match frame {
        ServerFrame::Welcome { id } => write_stdout(&format!("*** connected as {id}")).await,
        ServerFrame::Delivery { message } => write_stdout(&render_delivery(&message)).await,
        ServerFrame::Error { message } => write_stderr(&format!("!!! {message}")).await,
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
