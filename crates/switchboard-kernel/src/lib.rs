use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use switchboard_contracts::{Entity, NluResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Location,
    DrinkName,
    DrinkSize,
}

impl Slot {
    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Location => "location",
            Slot::DrinkName => "drink_name",
            Slot::DrinkSize => "drink_size",
        }
    }
}

const DRINK_SLOTS: [Slot; 2] = [Slot::DrinkName, Slot::DrinkSize];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    GetHelp,
    GetWeather,
    OrderDrink,
    Goodbye,
    UpstreamError,
    Empty,
    Unknown,
}

impl Intent {
    pub fn parse(tag: &str) -> Intent {
        match tag.trim() {
            "" => Intent::Empty,
            "greeting" => Intent::Greeting,
            "get_help" => Intent::GetHelp,
            "get_weather" => Intent::GetWeather,
            "order_drink" => Intent::OrderDrink,
            "goodbye" => Intent::Goodbye,
            tag if tag.starts_with("error_") => Intent::UpstreamError,
            _ => Intent::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DialogueState {
    #[serde(default)]
    pub pending_question: Option<Slot>,
    #[serde(default)]
    pub pending_slots: BTreeMap<String, String>,
    #[serde(default)]
    pub last_intent: Option<String>,
}

impl DialogueState {
    pub fn is_idle(&self) -> bool {
        self.pending_question.is_none() && self.pending_slots.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Reply,
    AskSlot,
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Greeted,
    HelpOffered,
    WeatherAnswered,
    AskedLocation,
    StillAskingLocation,
    AskedDrinkName,
    StillAskingDrinkName,
    AskedDrinkSize,
    StillAskingDrinkSize,
    OrderConfirmed,
    Farewell,
    UpstreamApology,
    UnknownIntent,
    EmptyUtterance,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Greeted => "greeted",
            Outcome::HelpOffered => "help_offered",
            Outcome::WeatherAnswered => "weather_answered",
            Outcome::AskedLocation => "asked_location",
            Outcome::StillAskingLocation => "still_asking_location",
            Outcome::AskedDrinkName => "asked_drink_name",
            Outcome::StillAskingDrinkName => "still_asking_drink_name",
            Outcome::AskedDrinkSize => "asked_drink_size",
            Outcome::StillAskingDrinkSize => "still_asking_drink_size",
            Outcome::OrderConfirmed => "order_confirmed",
            Outcome::Farewell => "farewell",
            Outcome::UpstreamApology => "upstream_apology",
            Outcome::UnknownIntent => "unknown_intent",
            Outcome::EmptyUtterance => "empty_utterance",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub action: Action,
    pub outcome: Outcome,
    pub slots: BTreeMap<String, String>,
}

pub fn decide(nlu: &NluResult, state: &DialogueState) -> (Decision, DialogueState) {
    let intent = Intent::parse(&nlu.intent);
    if let Some(slot) = state.pending_question {
        if continues_pending(intent, slot) {
            return resolve_pending(slot, nlu, state);
        }
    }
    dispatch(intent, nlu)
}

fn continues_pending(intent: Intent, slot: Slot) -> bool {
    match intent {
        Intent::Empty | Intent::Unknown => true,
        Intent::OrderDrink => matches!(slot, Slot::DrinkName | Slot::DrinkSize),
        _ => false,
    }
}

fn resolve_pending(slot: Slot, nlu: &NluResult, state: &DialogueState) -> (Decision, DialogueState) {
    let value = entity_value(&nlu.entities, slot.as_str())
        .map(str::to_string)
        .or_else(|| {
            let text = nlu.processed_text.trim();
            (!text.is_empty()).then(|| text.to_string())
        });

    let mut next = state.clone();
    next.last_intent = Some(nlu.intent.clone());

    let Some(value) = value else {
        let decision = Decision {
            action: Action::AskSlot,
            outcome: still_asking(slot),
            slots: next.pending_slots.clone(),
        };
        return (decision, next);
    };

    next.pending_slots.insert(slot.as_str().to_string(), value);
    match slot {
        Slot::Location => complete_weather(next, nlu),
        Slot::DrinkName | Slot::DrinkSize => advance_order(next),
    }
}

fn dispatch(intent: Intent, nlu: &NluResult) -> (Decision, DialogueState) {
    let mut next = DialogueState {
        last_intent: Some(nlu.intent.clone()),
        ..DialogueState::default()
    };

    match intent {
        Intent::Greeting => reply(Outcome::Greeted, BTreeMap::new(), next),
        Intent::GetHelp => reply(Outcome::HelpOffered, BTreeMap::new(), next),
        Intent::GetWeather => match entity_value(&nlu.entities, Slot::Location.as_str()) {
            Some(location) => {
                let mut slots = BTreeMap::new();
                slots.insert(Slot::Location.as_str().to_string(), location.to_string());
                if let Some(date) = entity_value(&nlu.entities, "date") {
                    slots.insert("date".to_string(), date.to_string());
                }
                reply(Outcome::WeatherAnswered, slots, next)
            }
            None => {
                next.pending_question = Some(Slot::Location);
                let decision = Decision {
                    action: Action::AskSlot,
                    outcome: Outcome::AskedLocation,
                    slots: BTreeMap::new(),
                };
                (decision, next)
            }
        },
        Intent::OrderDrink => {
            for slot in DRINK_SLOTS {
                if let Some(value) = entity_value(&nlu.entities, slot.as_str()) {
                    next.pending_slots
                        .insert(slot.as_str().to_string(), value.to_string());
                }
            }
            advance_order(next)
        }
        Intent::Goodbye => {
            let decision = Decision {
                action: Action::Terminate,
                outcome: Outcome::Farewell,
                slots: BTreeMap::new(),
            };
            (decision, DialogueState::default())
        }
        Intent::UpstreamError => reply(Outcome::UpstreamApology, BTreeMap::new(), next),
        Intent::Unknown => reply(Outcome::UnknownIntent, BTreeMap::new(), next),
        Intent::Empty => reply(Outcome::EmptyUtterance, BTreeMap::new(), next),
    }
}

fn advance_order(mut next: DialogueState) -> (Decision, DialogueState) {
    match first_missing_drink_slot(&next.pending_slots) {
        Some(slot) => {
            next.pending_question = Some(slot);
            let decision = Decision {
                action: Action::AskSlot,
                outcome: asking(slot),
                slots: next.pending_slots.clone(),
            };
            (decision, next)
        }
        None => {
            let slots = std::mem::take(&mut next.pending_slots);
            next.pending_question = None;
            let decision = Decision {
                action: Action::Reply,
                outcome: Outcome::OrderConfirmed,
                slots,
            };
            (decision, next)
        }
    }
}

fn complete_weather(mut next: DialogueState, nlu: &NluResult) -> (Decision, DialogueState) {
    let mut slots = BTreeMap::new();
    if let Some(location) = next.pending_slots.get(Slot::Location.as_str()) {
        slots.insert(Slot::Location.as_str().to_string(), location.clone());
    }
    if let Some(date) = entity_value(&nlu.entities, "date") {
        slots.insert("date".to_string(), date.to_string());
    }
    next.pending_question = None;
    next.pending_slots.clear();
    let decision = Decision {
        action: Action::Reply,
        outcome: Outcome::WeatherAnswered,
        slots,
    };
    (decision, next)
}

fn reply(
    outcome: Outcome,
    slots: BTreeMap<String, String>,
    next: DialogueState,
) -> (Decision, DialogueState) {
    let decision = Decision {
        action: Action::Reply,
        outcome,
        slots,
    };
    (decision, next)
}

fn first_missing_drink_slot(filled: &BTreeMap<String, String>) -> Option<Slot> {
    DRINK_SLOTS
        .iter()
        .copied()
        .find(|slot| !filled.contains_key(slot.as_str()))
}

fn entity_value<'a>(entities: &'a [Entity], name: &str) -> Option<&'a str> {
    entities
        .iter()
        .find(|e| e.name == name && !e.value.trim().is_empty())
        .map(|e| e.value.as_str())
}

fn asking(slot: Slot) -> Outcome {
    match slot {
        Slot::Location => Outcome::AskedLocation,
        Slot::DrinkName => Outcome::AskedDrinkName,
        Slot::DrinkSize => Outcome::AskedDrinkSize,
    }
}

fn still_asking(slot: Slot) -> Outcome {
    match slot {
        Slot::Location => Outcome::StillAskingLocation,
        Slot::DrinkName => Outcome::StillAskingDrinkName,
        Slot::DrinkSize => Outcome::StillAskingDrinkSize,
    }
}

pub fn render(decision: &Decision) -> String {
    match decision.outcome {
        Outcome::Greeted => "Hello there! How can I help you today?".to_string(),
        Outcome::HelpOffered => {
            "I understand you need help. I'll do my best to assist you.".to_string()
        }
        Outcome::WeatherAnswered => {
            let location = slot_or(decision, Slot::Location.as_str(), "your area");
            match decision.slots.get("date") {
                Some(date) => format!(
                    "I'm sorry, I can't fetch the actual weather for {location} for {date}, but I hope it's pleasant!"
                ),
                None => format!(
                    "I'm sorry, I can't fetch the actual weather for {location}, but I hope it's pleasant!"
                ),
            }
        }
        Outcome::AskedLocation => "Sure! Which city would you like the weather for?".to_string(),
        Outcome::StillAskingLocation => {
            "Sorry, I didn't catch a city name. Which city would you like the weather for?"
                .to_string()
        }
        Outcome::AskedDrinkName => "What drink would you like?".to_string(),
        Outcome::StillAskingDrinkName => {
            "Sorry, I didn't catch that. What drink would you like?".to_string()
        }
        Outcome::AskedDrinkSize => "What size would you like?".to_string(),
        Outcome::StillAskingDrinkSize => {
            "Sorry, I didn't catch that. What size would you like?".to_string()
        }
        Outcome::OrderConfirmed => {
            let size = slot_or(decision, Slot::DrinkSize.as_str(), "regular");
            let name = slot_or(decision, Slot::DrinkName.as_str(), "drink");
            format!("Okay, one {size} {name} coming up!")
        }
        Outcome::Farewell => "Goodbye! Talk to you soon.".to_string(),
        Outcome::UpstreamApology => {
            "I'm sorry, I'm having trouble understanding requests right now. Please try again in a moment."
                .to_string()
        }
        Outcome::UnknownIntent => {
            "I'm sorry, I didn't quite understand that. Could you say it again?".to_string()
        }
        Outcome::EmptyUtterance => "I'm not sure what you mean. Can you try rephrasing?".to_string(),
    }
}

fn slot_or<'a>(decision: &'a Decision, name: &str, fallback: &'a str) -> &'a str {
    decision
        .slots
        .get(name)
        .map(String::as_str)
        .unwrap_or(fallback)
}
