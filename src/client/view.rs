use crate::database::MessageEntity;

/// 一次拉取请求的来源，用于丢弃过期的响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    group_id: String,
    epoch: u64,
}

impl FetchTicket {
    pub fn group_id(&self) -> &str {
        &self.group_id
    }
}

/// 当前打开的会话。切换或关闭会话后，之前发出的请求结果不会再写入
#[derive(Debug, Default)]
pub struct ConversationView {
    current: Option<String>,
    epoch: u64,
    messages: Vec<MessageEntity>,
}

impl ConversationView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, group_id: &str) {
        self.epoch += 1;
        self.current = Some(group_id.to_string());
        self.messages.clear();
    }

    pub fn close(&mut self) {
        self.epoch += 1;
        self.current = None;
        self.messages.clear();
    }

    pub fn current_group(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn messages(&self) -> &[MessageEntity] {
        &self.messages
    }

    /// 发起拉取前取票，没有打开的会话时返回 None
    pub fn ticket(&self) -> Option<FetchTicket> {
        self.current.as_ref().map(|group_id| FetchTicket {
            group_id: group_id.clone(),
            epoch: self.epoch,
        })
    }

    /// 只有票据仍对应当前会话时才应用结果
    pub fn apply(&mut self, ticket: &FetchTicket, messages: Vec<MessageEntity>) -> bool {
        let current = self.current.as_deref() == Some(ticket.group_id.as_str());
        if !current || ticket.epoch != self.epoch {
            tracing::debug!("Dropping stale messages for group {}", ticket.group_id);
            return false;
        }
        self.messages = messages;
        true
    }
}
