//! Recording transports. Sends append to in-memory outboxes; a blank
//! recipient fails like a real provider that cannot resolve one.

use std::sync::Mutex;

use async_trait::async_trait;
use esn_workers::{EmailMessage, EmailTransport, SmsMessage, SmsTransport, TransportError};

#[derive(Default)]
pub struct MemoryMailbox {
    emails: Mutex<Vec<EmailMessage>>,
    sms: Mutex<Vec<SmsMessage>>,
    /// When set, the next N email sends fail as unavailable (retry tests).
    fail_next_emails: Mutex<usize>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emails(&self) -> Vec<EmailMessage> {
        self.emails.lock().unwrap().clone()
    }

    pub fn sms_messages(&self) -> Vec<SmsMessage> {
        self.sms.lock().unwrap().clone()
    }

    pub fn emails_to(&self, addr: &str) -> Vec<EmailMessage> {
        self.emails
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.to == addr)
            .cloned()
            .collect()
    }

    pub fn fail_next_emails(&self, n: usize) {
        *self.fail_next_emails.lock().unwrap() = n;
    }
}

#[async_trait]
impl EmailTransport for MemoryMailbox {
    async fn send_email(&self, msg: &EmailMessage) -> Result<(), TransportError> {
        if msg.to.trim().is_empty() {
            return Err(TransportError::Unresolvable("empty email address".into()));
        }
        {
            let mut fail = self.fail_next_emails.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(TransportError::Unavailable("injected failure".into()));
            }
        }
        self.emails.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

#[async_trait]
impl SmsTransport for MemoryMailbox {
    async fn send_sms(&self, msg: &SmsMessage) -> Result<(), TransportError> {
        if msg.to.trim().is_empty() {
            return Err(TransportError::Unresolvable("no phone number on file".into()));
        }
        self.sms.lock().unwrap().push(msg.clone());
        Ok(())
    }
}
