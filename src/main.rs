use std::{future::Future, pin::Pin};

use tablemq::pipeline::{MessageContext, MessageHandler};

/// Logs every message it receives.
struct LogHandler;

impl MessageHandler for LogHandler {
    fn on_message<'a>(
        &'a self,
        ctx: MessageContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            tracing::info!(
                queue = %ctx.receive_address,
                message_id = %ctx.message.transport_id(),
                message_types = ctx.message.enclosed_message_types().unwrap_or("unknown"),
                bytes = ctx.message.body().len(),
                "Received message"
            );
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tablemq::run().handler(LogHandler).start().await
}
