//! Message worker: drains the internal queue fed by the webhook receiver
//! and runs the reply pipeline. Every stage gets exactly one attempt and
//! failures never propagate past this module; there is no caller to
//! report to.

use forno_contracts::{InboundMessage, SendTextRequest};
use forno_kernel::{build_system_prompt, render_context, EventStats};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::store::EventQuery;
use crate::AppState;

const FALLBACK_REPLY: &str =
    "Desculpe, ocorreu um erro ao processar sua mensagem. Por favor, tente novamente.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    IgnoredSelf,
    IgnoredNonText,
    Replied,
    Failed,
}

pub(crate) fn spawn_worker(state: AppState, mut rx: mpsc::Receiver<InboundMessage>) {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let message_id = message.message_id.clone();
            let outcome = handle_inbound(&state, message).await;
            info!(message_id, ?outcome, "message pipeline finished");
        }
    });
}

pub async fn handle_inbound(state: &AppState, message: InboundMessage) -> MessageOutcome {
    if message.from_me {
        info!(message_id = %message.message_id, "ignoring message from self");
        return MessageOutcome::IgnoredSelf;
    }
    let text = match &message.text {
        Some(text) if !text.message.trim().is_empty() => text.message.clone(),
        _ => {
            info!(message_id = %message.message_id, "ignoring non-text message");
            return MessageOutcome::IgnoredNonText;
        }
    };

    let context = build_events_context(state).await;
    let system_prompt = build_system_prompt((!context.is_empty()).then_some(context.as_str()));

    let reply = match state.completion.complete(&system_prompt, &text).await {
        Ok(reply) => reply,
        Err(err) => {
            error!(phone = %message.phone, %err, "completion call failed");
            send_apology(state, &message.phone).await;
            return MessageOutcome::Failed;
        }
    };

    let request = SendTextRequest {
        phone: message.phone.clone(),
        message: reply,
        delay_message: None,
        delay_typing: state.cfg.gateway.delay_typing_ms,
    };
    match state.gateway.send_text(&request).await {
        Ok(receipt) => {
            info!(
                phone = %message.phone,
                gateway_message_id = %receipt.message_id,
                "reply dispatched"
            );
            MessageOutcome::Replied
        }
        Err(err) => {
            error!(phone = %message.phone, %err, "gateway send failed");
            send_apology(state, &message.phone).await;
            MessageOutcome::Failed
        }
    }
}

/// Recent-event context for the prompt. Any failure here degrades to an
/// empty context so the agent can still answer.
async fn build_events_context(state: &AppState) -> String {
    let query = EventQuery {
        store_id: Some(state.cfg.agent.store_id.clone()),
        kind: Some("menu".to_string()),
        limit: Some(state.cfg.agent.context_event_limit),
    };
    let events = {
        let store = state.store.lock().await;
        store.list_events(&query)
    };
    match events {
        Ok(events) if events.is_empty() => String::new(),
        Ok(events) => render_context(&EventStats::aggregate(&events)),
        Err(err) => {
            warn!(%err, "fetching events for context failed, continuing without context");
            String::new()
        }
    }
}

async fn send_apology(state: &AppState, phone: &str) {
    let request = SendTextRequest {
        phone: phone.to_string(),
        message: FALLBACK_REPLY.to_string(),
        delay_message: None,
        delay_typing: state.cfg.gateway.delay_typing_ms,
    };
    if let Err(err) = state.gateway.send_text(&request).await {
        error!(%phone, %err, "apology send failed, giving up");
    }
}
