//! Events notified to plugin and reader observers

use crate::selection::CardSelectionResponse;

/// Kind of a [`ReaderEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReaderEventType {
    /// A card has been inserted (no selection scenario, or none matched with
    /// the `Always` notification policy).
    CardInserted,
    /// A card has been inserted and matched the scheduled selection scenario.
    CardMatched,
    /// The card has been removed.
    CardRemoved,
    /// The reader has been unregistered and will emit no further event.
    Unavailable,
}

/// Event notified to card reader observers.
#[derive(Debug, Clone)]
pub struct ReaderEvent {
    plugin_name: String,
    reader_name: String,
    event_type: ReaderEventType,
    selection_responses: Option<Vec<CardSelectionResponse>>,
}

impl ReaderEvent {
    pub(crate) fn new(
        plugin_name: impl Into<String>,
        reader_name: impl Into<String>,
        event_type: ReaderEventType,
        selection_responses: Option<Vec<CardSelectionResponse>>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            reader_name: reader_name.into(),
            event_type,
            selection_responses,
        }
    }

    /// Name of the plugin owning the reader.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Name of the reader the event originates from.
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Kind of event.
    pub fn event_type(&self) -> ReaderEventType {
        self.event_type
    }

    /// Responses of the scheduled selection scenario, when one ran on
    /// insertion.
    pub fn scheduled_selection_responses(&self) -> Option<&[CardSelectionResponse]> {
        self.selection_responses.as_deref()
    }
}

/// Kind of a [`PluginEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginEventType {
    /// One or more readers appeared.
    ReaderConnected,
    /// One or more readers disappeared.
    ReaderDisconnected,
    /// The plugin has been unregistered and will emit no further event.
    Unavailable,
}

/// Event notified to plugin observers.
#[derive(Debug, Clone)]
pub struct PluginEvent {
    plugin_name: String,
    reader_names: Vec<String>,
    event_type: PluginEventType,
}

impl PluginEvent {
    pub(crate) fn new(
        plugin_name: impl Into<String>,
        reader_names: Vec<String>,
        event_type: PluginEventType,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            reader_names,
            event_type,
        }
    }

    /// Name of the plugin the event originates from.
    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    /// Names of the readers concerned by the event.
    pub fn reader_names(&self) -> &[String] {
        &self.reader_names
    }

    /// Kind of event.
    pub fn event_type(&self) -> PluginEventType {
        self.event_type
    }
}
