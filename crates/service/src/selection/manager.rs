//! Application-facing builder and analyzer for card selection scenarios

use tracing::debug;

use crate::error::{Error, Result};
use crate::reader::{DetectionMode, NotificationMode, ObservableReader, Reader};
use crate::selection::{
    CardSelectionRequest, CardSelectionResponse, CardSelectionScenario, ChannelControl,
    MultiSelectionProcessing,
};

/// Accumulates selection requests and runs (or schedules) them as a scenario.
#[derive(Debug, Default)]
pub struct CardSelectionManager {
    card_selection_requests: Vec<CardSelectionRequest>,
    multi_selection_processing: MultiSelectionProcessing,
    channel_control: ChannelControl,
}

impl CardSelectionManager {
    /// Create an empty manager: first-match processing, channel kept open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch between first-match and process-all multi-selection modes.
    pub fn set_multi_selection_processing(&mut self, mode: MultiSelectionProcessing) {
        self.multi_selection_processing = mode;
    }

    /// Append a selection request and return its index in the scenario.
    pub fn prepare_selection(&mut self, request: CardSelectionRequest) -> usize {
        self.card_selection_requests.push(request);
        self.card_selection_requests.len() - 1
    }

    /// Release the physical channel once the scenario completes.
    pub fn prepare_release_channel(&mut self) {
        self.channel_control = ChannelControl::CloseAfter;
    }

    fn scenario(&self) -> Result<CardSelectionScenario> {
        if self.card_selection_requests.is_empty() {
            return Err(Error::illegal_state("no card selection has been prepared"));
        }
        Ok(CardSelectionScenario::new(
            self.card_selection_requests.clone(),
            self.multi_selection_processing,
            self.channel_control,
        ))
    }

    /// Run the prepared scenario explicitly against a card already present in
    /// the given reader.
    pub fn process_card_selection_scenario(&self, reader: &Reader) -> Result<CardSelectionResult> {
        let scenario = self.scenario()?;
        debug!(
            reader = %reader.name(),
            selections = scenario.card_selection_requests().len(),
            "processing card selection scenario"
        );
        let responses = reader.transmit_card_selection_requests(
            scenario.card_selection_requests(),
            scenario.multi_selection_processing(),
            scenario.channel_control(),
        )?;
        Ok(CardSelectionResult::from_responses(responses))
    }

    /// Arm the prepared scenario on an observable reader: it will run as soon
    /// as a card is detected, and its result will ride along the reader event.
    pub fn schedule_card_selection_scenario(
        &self,
        reader: &ObservableReader,
        notification_mode: NotificationMode,
        detection_mode: DetectionMode,
    ) -> Result<()> {
        let scenario = self.scenario()?;
        reader.schedule_card_selection_scenario(scenario, notification_mode, detection_mode);
        Ok(())
    }

    /// Interpret the selection responses carried by a reader event.
    pub fn parse_scheduled_card_selections_response(
        &self,
        responses: &[CardSelectionResponse],
    ) -> CardSelectionResult {
        CardSelectionResult::from_responses(responses.to_vec())
    }
}

/// Result of a processed selection scenario.
#[derive(Debug, Clone)]
pub struct CardSelectionResult {
    responses: Vec<CardSelectionResponse>,
    active_selection_index: Option<usize>,
}

impl CardSelectionResult {
    fn from_responses(responses: Vec<CardSelectionResponse>) -> Self {
        let active_selection_index = responses.iter().position(CardSelectionResponse::has_matched);
        Self {
            responses,
            active_selection_index,
        }
    }

    /// All collected selection responses, in scenario order.
    pub fn responses(&self) -> &[CardSelectionResponse] {
        &self.responses
    }

    /// Index of the first matching selection, if any.
    pub fn active_selection_index(&self) -> Option<usize> {
        self.active_selection_index
    }

    /// The first matching selection response, if any.
    pub fn active_selection(&self) -> Option<&CardSelectionResponse> {
        self.active_selection_index.map(|i| &self.responses[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::CardSelector;

    #[test]
    fn empty_manager_rejects_processing() {
        let manager = CardSelectionManager::new();
        assert!(matches!(manager.scenario(), Err(Error::IllegalState(_))));
    }

    #[test]
    fn prepared_selections_keep_their_index() {
        let mut manager = CardSelectionManager::new();
        let first = manager.prepare_selection(CardSelectionRequest::new(CardSelector::new()));
        let second = manager.prepare_selection(CardSelectionRequest::new(CardSelector::new()));
        assert_eq!((first, second), (0, 1));

        let scenario = manager.scenario().unwrap();
        assert_eq!(scenario.card_selection_requests().len(), 2);
        assert_eq!(
            scenario.multi_selection_processing(),
            MultiSelectionProcessing::FirstMatch
        );
        assert_eq!(scenario.channel_control(), ChannelControl::KeepOpen);
    }

    #[test]
    fn release_channel_switches_channel_control() {
        let mut manager = CardSelectionManager::new();
        manager.prepare_selection(CardSelectionRequest::new(CardSelector::new()));
        manager.prepare_release_channel();
        let scenario = manager.scenario().unwrap();
        assert_eq!(scenario.channel_control(), ChannelControl::CloseAfter);
    }

    #[test]
    fn result_analysis_finds_first_match() {
        let responses = vec![
            CardSelectionResponse::new(String::new(), None, false, None),
            CardSelectionResponse::new("3B00".to_string(), None, true, None),
            CardSelectionResponse::new("3B00".to_string(), None, true, None),
        ];
        let result = CardSelectionResult::from_responses(responses);
        assert_eq!(result.active_selection_index(), Some(1));
        assert!(result.active_selection().unwrap().has_matched());
    }
}
