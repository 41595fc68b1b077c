use std::error::Error;
use std::path::Path;

use docchat_relay::{ChatOrchestrator, DocumentQuestion, split_answer};
use tokio::io::AsyncWriteExt as _;
use tracing::debug;

use crate::config::AskArgs;

/// Reads the documents, asks the question and writes the answer to stdout.
pub async fn run(args: AskArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let orchestrator = args.upstream.orchestrator()?;
    let question = load_question(&args.documents, &args.question).await?;
    let mut stdout = tokio::io::stdout();
    answer(&orchestrator, question, args.remarks, &mut stdout).await
}

pub(crate) async fn load_question<P: AsRef<Path>>(
    documents: &[P],
    question: &str,
) -> Result<DocumentQuestion, Box<dyn Error + Send + Sync>> {
    let mut texts = Vec::with_capacity(documents.len());
    for path in documents {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
        debug!(path = %path.display(), bytes = text.len(), "document loaded");
        texts.push(text);
    }
    Ok(DocumentQuestion::across(texts, question))
}

/// Streams fragments as they arrive, or prints the formatted answer once
/// complete when `remarks` is set.
pub(crate) async fn answer<W>(
    orchestrator: &ChatOrchestrator,
    question: DocumentQuestion,
    remarks: bool,
    out: &mut W,
) -> Result<(), Box<dyn Error + Send + Sync>>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut stream = orchestrator.ask(question).await?;
    if remarks {
        let text = stream.collect_answer().await?;
        out.write_all(split_answer(&text).render().as_bytes()).await?;
    } else {
        while let Some(fragment) = stream.next_fragment().await {
            out.write_all(&fragment?).await?;
            out.flush().await?;
        }
    }
    out.write_all(b"\n").await?;
    out.flush().await?;
    Ok(())
}
