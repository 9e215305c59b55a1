//! Serving an interactive CLI on the local standard streams.

use async_trait::async_trait;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};

use crate::term::{Geometry, Icli, Term, TermError};

/// Terminal backed by a buffered reader and a single writer.
///
/// `write_err` shares the writer with `write_out`.
pub struct LocalTerm<R, W> {
    reader: R,
    writer: W,
    closed: bool,
}

impl LocalTerm<BufReader<Stdin>, Stdout> {
    /// Terminal over the process' stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> LocalTerm<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            closed: false,
        }
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), TermError> {
        if self.closed {
            return Err(TermError::Closed);
        }
        self.writer.write_all(buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<R, W> Term for LocalTerm<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_line(&mut self) -> Result<String, TermError> {
        if self.closed {
            return Err(TermError::Closed);
        }
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(TermError::Eof);
        }
        if line.ends_with('\n') {
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
        }
        Ok(line)
    }

    async fn write_out(&mut self, buf: &[u8]) -> Result<(), TermError> {
        self.write(buf).await
    }

    async fn write_err(&mut self, buf: &[u8]) -> Result<(), TermError> {
        self.write(buf).await
    }

    fn size(&self) -> Geometry {
        Geometry::default()
    }

    async fn close(&mut self) {
        if !self.closed {
            let _ = self.writer.flush().await;
            self.closed = true;
        }
    }
}

/// Run `cli` once against the local standard streams.
pub async fn serve_local<C: Icli + ?Sized>(cli: &C) {
    serve_local_with(cli, LocalTerm::stdio()).await;
}

/// Run `cli` once against an already constructed local terminal.
pub async fn serve_local_with<C, R, W>(cli: &C, mut term: LocalTerm<R, W>) -> LocalTerm<R, W>
where
    C: Icli + ?Sized,
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    tracing::debug!("Serving interactive CLI on local terminal");
    cli.run(&mut term).await;
    term.close().await;
    term
}
