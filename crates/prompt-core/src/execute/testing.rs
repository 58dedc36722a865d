//! Scripted completion provider for tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::execute::provider::{
    Completion, CompletionError, CompletionParams, CompletionProvider, FinishReason,
};
use crate::message::Message;

type Reply = Result<Completion, CompletionError>;

enum Mode {
    Script(VecDeque<Reply>),
    Repeat(Reply),
    /// Reply with the last message's content
    Echo { fail_on: Option<String> },
    /// Reply per call by looking at the last message
    Respond(Box<dyn Fn(&str) -> Reply + Send + Sync>),
    /// Never reply
    Hang,
}

pub struct ScriptedProvider {
    mode: Mutex<Mode>,
    requests: Mutex<Vec<(Vec<Message>, CompletionParams)>>,
    delay: Duration,
}

impl ScriptedProvider {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            requests: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    pub fn new(replies: Vec<Reply>) -> Self {
        Self::with_mode(Mode::Script(replies.into()))
    }

    pub fn repeating(reply: Reply) -> Self {
        Self::with_mode(Mode::Repeat(reply))
    }

    pub fn echo() -> Self {
        Self::with_mode(Mode::Echo { fail_on: None })
    }

    pub fn echo_failing_on(needle: &str) -> Self {
        Self::with_mode(Mode::Echo {
            fail_on: Some(needle.to_string()),
        })
    }

    pub fn responding<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        Self::with_mode(Mode::Respond(Box::new(respond)))
    }

    pub fn hanging() -> Self {
        Self::with_mode(Mode::Hang)
    }

    /// Sleep this long before every reply.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<(Vec<Message>, CompletionParams)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn complete(
        &self,
        messages: &[Message],
        params: &CompletionParams,
        _timeout: Duration,
    ) -> Result<Completion, CompletionError> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), params.clone()));
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();

        let hang = matches!(*self.mode.lock().unwrap(), Mode::Hang);
        if hang {
            return std::future::pending().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut mode = self.mode.lock().unwrap();
        match &mut *mode {
            Mode::Script(replies) => replies
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Other("script exhausted".into()))),
            Mode::Repeat(reply) => reply.clone(),
            Mode::Echo { fail_on } => match fail_on {
                Some(needle) if last.contains(needle.as_str()) => {
                    Err(CompletionError::Connection("scripted failure".into()))
                }
                _ => Ok(Completion::text(last, FinishReason::Stop).with_usage(10, 5)),
            },
            Mode::Respond(respond) => respond(&last),
            Mode::Hang => Err(CompletionError::Other("unreachable".into())),
        }
    }
}
