//! Interactive terminal client: each stdin line is sent as one command and
//! every line the node sends back is printed.

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    select,
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, wire::write_line};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());

    run_client_loop(&mut reader, &mut writer, &mut stdin).await?;
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(
    args: &ClientArgs,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    info!("connected to {}", args.server);

    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

/// Both reads use `read_until` into buffers that outlive each `select!`
/// round, so a line half-read when the other branch wins is kept, not lost.
async fn run_client_loop<R, W, I>(reader: &mut R, writer: &mut W, stdin: &mut I) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
{
    let mut reply = Vec::new();
    let mut input = Vec::new();

    loop {
        select! {
            bytes_read = reader.read_until(b'\n', &mut reply) => {
                let keep_going = handle_server_line(bytes_read, &reply).await?;
                reply.clear();
                if !keep_going {
                    break;
                }
            }
            bytes_read = stdin.read_until(b'\n', &mut input) => {
                let keep_going = handle_stdin_input(bytes_read, &input, writer).await?;
                input.clear();
                if !keep_going {
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

async fn handle_server_line(bytes_read: io::Result<usize>, line: &[u8]) -> Result<bool> {
    if bytes_read? == 0 {
        write_stdout("*** server closed the connection").await?;
        return Ok(false);
    }

    let line = String::from_utf8_lossy(line);
    write_stdout(line.trim_end_matches(['\r', '\n'])).await?;
    Ok(true)
}

async fn handle_stdin_input<W>(
    bytes_read: io::Result<usize>,
    input: &[u8],
    writer: &mut W,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let input = String::from_utf8_lossy(input);
    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        return Ok(false);
    }

    write_line(writer, text).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
