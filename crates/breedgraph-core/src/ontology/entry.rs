use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, EntryId};
use crate::DomainError;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),*];

            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),*
                }
            }

            #[must_use]
            pub fn parse(value: &str) -> Option<Self> {
                let upper = value.to_ascii_uppercase();
                Self::ALL.iter().copied().find(|candidate| candidate.as_str() == upper)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use string_enum;

string_enum!(
    /// The closed set of ontology entry kinds.
    OntologyEntryLabel {
        Term => "TERM",
        Subject => "SUBJECT",
        Trait => "TRAIT",
        Condition => "CONDITION",
        Exposure => "EXPOSURE",
        Scale => "SCALE",
        Category => "CATEGORY",
        ObservationMethod => "OBSERVATION_METHOD",
        ControlMethod => "CONTROL_METHOD",
        Variable => "VARIABLE",
        Factor => "FACTOR",
        Event => "EVENT",
        LocationType => "LOCATION_TYPE",
        LayoutType => "LAYOUT_TYPE",
        Design => "DESIGN",
        Role => "ROLE",
        Title => "TITLE",
        GermplasmMethod => "GERMPLASM_METHOD",
    }
);

string_enum!(ScaleType {
    Datetime => "DATETIME",
    Duration => "DURATION",
    Numerical => "NUMERICAL",
    Text => "TEXT",
    Nominal => "NOMINAL",
    Ordinal => "ORDINAL",
    Germplasm => "GERMPLASM",
});

string_enum!(ObservationType {
    Measurement => "MEASUREMENT",
    Counting => "COUNTING",
    Estimation => "ESTIMATION",
    Computation => "COMPUTATION",
    Prediction => "PREDICTION",
    Description => "DESCRIPTION",
    Classification => "CLASSIFICATION",
});

string_enum!(AxisType {
    Nominal => "NOMINAL",
    Ordinal => "ORDINAL",
    Coordinate => "COORDINATE",
    Cartesian => "CARTESIAN",
});

/// Label plus the fields only some labels carry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "label", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryKind {
    Term,
    Subject,
    Trait,
    Condition,
    Exposure,
    Scale { scale_type: ScaleType },
    Category,
    ObservationMethod { observation_type: ObservationType },
    ControlMethod,
    Variable,
    Factor,
    Event,
    LocationType,
    LayoutType { axes: Vec<AxisType> },
    Design,
    Role,
    Title,
    GermplasmMethod,
}

impl EntryKind {
    #[must_use]
    pub fn label(&self) -> OntologyEntryLabel {
        match self {
            Self::Term => OntologyEntryLabel::Term,
            Self::Subject => OntologyEntryLabel::Subject,
            Self::Trait => OntologyEntryLabel::Trait,
            Self::Condition => OntologyEntryLabel::Condition,
            Self::Exposure => OntologyEntryLabel::Exposure,
            Self::Scale { .. } => OntologyEntryLabel::Scale,
            Self::Category => OntologyEntryLabel::Category,
            Self::ObservationMethod { .. } => OntologyEntryLabel::ObservationMethod,
            Self::ControlMethod => OntologyEntryLabel::ControlMethod,
            Self::Variable => OntologyEntryLabel::Variable,
            Self::Factor => OntologyEntryLabel::Factor,
            Self::Event => OntologyEntryLabel::Event,
            Self::LocationType => OntologyEntryLabel::LocationType,
            Self::LayoutType { .. } => OntologyEntryLabel::LayoutType,
            Self::Design => OntologyEntryLabel::Design,
            Self::Role => OntologyEntryLabel::Role,
            Self::Title => OntologyEntryLabel::Title,
            Self::GermplasmMethod => OntologyEntryLabel::GermplasmMethod,
        }
    }

    /// Kind for labels that carry no extra fields.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for SCALE, OBSERVATION_METHOD and
    /// LAYOUT_TYPE, whose extra fields must be supplied.
    pub fn plain(label: OntologyEntryLabel) -> Result<Self, DomainError> {
        Ok(match label {
            OntologyEntryLabel::Term => Self::Term,
            OntologyEntryLabel::Subject => Self::Subject,
            OntologyEntryLabel::Trait => Self::Trait,
            OntologyEntryLabel::Condition => Self::Condition,
            OntologyEntryLabel::Exposure => Self::Exposure,
            OntologyEntryLabel::Category => Self::Category,
            OntologyEntryLabel::ControlMethod => Self::ControlMethod,
            OntologyEntryLabel::Variable => Self::Variable,
            OntologyEntryLabel::Factor => Self::Factor,
            OntologyEntryLabel::Event => Self::Event,
            OntologyEntryLabel::LocationType => Self::LocationType,
            OntologyEntryLabel::Design => Self::Design,
            OntologyEntryLabel::Role => Self::Role,
            OntologyEntryLabel::Title => Self::Title,
            OntologyEntryLabel::GermplasmMethod => Self::GermplasmMethod,
            OntologyEntryLabel::Scale
            | OntologyEntryLabel::ObservationMethod
            | OntologyEntryLabel::LayoutType => {
                return Err(DomainError::Validation(format!(
                    "{label} entries need type-specific fields"
                )))
            }
        })
    }

    #[must_use]
    pub fn scale_type(&self) -> Option<ScaleType> {
        match self {
            Self::Scale { scale_type } => Some(*scale_type),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), DomainError> {
        if let Self::LayoutType { axes } = self {
            if axes.is_empty() {
                return Err(DomainError::Validation(
                    "layout types need at least one axis".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Fields every entry carries, regardless of label.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EntryFields {
    pub name: String,
    #[serde(default)]
    pub abbreviation: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub authors: Vec<i64>,
    #[serde(default)]
    pub references: Vec<i64>,
}

impl EntryFields {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    fn validate(&self) -> Result<(), DomainError> {
        if self.name.trim().is_empty() {
            return Err(DomainError::Validation("entry name must be non-empty".to_string()));
        }
        if self.abbreviation.as_deref().is_some_and(|abbreviation| abbreviation.trim().is_empty())
        {
            return Err(DomainError::Validation("abbreviation must be non-empty".to_string()));
        }
        if self.synonyms.iter().any(|synonym| synonym.trim().is_empty()) {
            return Err(DomainError::Validation("synonyms must be non-empty".to_string()));
        }
        Ok(())
    }

    fn names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.synonyms.iter().map(String::as_str))
            .chain(self.abbreviation.as_deref())
            .collect()
    }
}

/// An entry not yet stored.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OntologyEntryInput {
    #[serde(flatten)]
    pub fields: EntryFields,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl OntologyEntryInput {
    /// # Errors
    /// Returns [`DomainError::Validation`] for blank names, blank synonyms or
    /// abbreviations, and layout types without axes.
    pub fn build(kind: EntryKind, fields: EntryFields) -> Result<Self, DomainError> {
        fields.validate()?;
        kind.validate()?;
        Ok(Self { fields, kind })
    }

    /// # Errors
    /// See [`OntologyEntryInput::build`].
    pub fn term(name: &str) -> Result<Self, DomainError> {
        Self::build(EntryKind::Term, EntryFields::named(name))
    }

    /// # Errors
    /// See [`OntologyEntryInput::build`].
    pub fn subject(name: &str) -> Result<Self, DomainError> {
        Self::build(EntryKind::Subject, EntryFields::named(name))
    }

    /// # Errors
    /// See [`OntologyEntryInput::build`].
    pub fn trait_(name: &str) -> Result<Self, DomainError> {
        Self::build(EntryKind::Trait, EntryFields::named(name))
    }

    /// # Errors
    /// See [`OntologyEntryInput::build`].
    pub fn scale(name: &str, scale_type: ScaleType) -> Result<Self, DomainError> {
        Self::build(EntryKind::Scale { scale_type }, EntryFields::named(name))
    }

    /// # Errors
    /// See [`OntologyEntryInput::build`].
    pub fn category(name: &str) -> Result<Self, DomainError> {
        Self::build(EntryKind::Category, EntryFields::named(name))
    }

    /// # Errors
    /// See [`OntologyEntryInput::build`].
    pub fn observation_method(
        name: &str,
        observation_type: ObservationType,
    ) -> Result<Self, DomainError> {
        Self::build(EntryKind::ObservationMethod { observation_type }, EntryFields::named(name))
    }

    /// # Errors
    /// See [`OntologyEntryInput::build`].
    pub fn layout_type(name: &str, axes: Vec<AxisType>) -> Result<Self, DomainError> {
        Self::build(EntryKind::LayoutType { axes }, EntryFields::named(name))
    }

    /// Entry of a label that carries no extra fields.
    ///
    /// # Errors
    /// See [`EntryKind::plain`] and [`OntologyEntryInput::build`].
    pub fn plain(label: OntologyEntryLabel, name: &str) -> Result<Self, DomainError> {
        Self::build(EntryKind::plain(label)?, EntryFields::named(name))
    }

    #[must_use]
    pub fn with_abbreviation(mut self, abbreviation: &str) -> Self {
        self.fields.abbreviation = Some(abbreviation.to_string());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: &str) -> Self {
        self.fields.description = Some(description.to_string());
        self
    }

    #[must_use]
    pub fn with_synonyms(mut self, synonyms: &[&str]) -> Self {
        self.fields.synonyms = synonyms.iter().map(|synonym| (*synonym).to_string()).collect();
        self
    }

    #[must_use]
    pub fn label(&self) -> OntologyEntryLabel {
        self.kind.label()
    }

    /// Name, then synonyms, then the abbreviation if set.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.fields.names()
    }

    #[must_use]
    pub fn into_stored(self, id: EntryId) -> OntologyEntry {
        OntologyEntry { id, fields: self.fields, kind: self.kind }
    }
}

/// A stored entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OntologyEntry {
    pub id: EntryId,
    #[serde(flatten)]
    pub fields: EntryFields,
    #[serde(flatten)]
    pub kind: EntryKind,
}

impl OntologyEntry {
    /// # Errors
    /// Returns [`DomainError::Validation`] for transient ids or invalid fields.
    pub fn load(id: EntryId, kind: EntryKind, fields: EntryFields) -> Result<Self, DomainError> {
        if id.is_transient() {
            return Err(DomainError::Validation(format!("stored entry id {id} must be positive")));
        }
        let input = OntologyEntryInput::build(kind, fields)?;
        Ok(input.into_stored(id))
    }

    #[must_use]
    pub fn label(&self) -> OntologyEntryLabel {
        self.kind.label()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.fields.name
    }

    /// Name, then synonyms, then the abbreviation if set.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.fields.names()
    }

    /// # Errors
    /// Returns [`DomainError::Validation`] when the edit leaves the entry invalid.
    pub fn apply(&mut self, fields: EntryFields) -> Result<(), DomainError> {
        fields.validate()?;
        self.fields = fields;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_list_name_then_synonyms_then_abbreviation() -> Result<(), DomainError> {
        let entry = OntologyEntryInput::trait_("Plant height")?
            .with_synonyms(&["Height", "Stature"])
            .with_abbreviation("PH");
        assert_eq!(entry.names(), vec!["Plant height", "Height", "Stature", "PH"]);
        Ok(())
    }

    #[test]
    fn blank_names_are_rejected() {
        assert!(OntologyEntryInput::term("  ").is_err());
        let fields = EntryFields { abbreviation: Some(String::new()), ..EntryFields::named("x") };
        assert!(OntologyEntryInput::build(EntryKind::Term, fields).is_err());
    }

    #[test]
    fn layout_types_need_axes() {
        assert!(OntologyEntryInput::layout_type("grid", Vec::new()).is_err());
        assert!(OntologyEntryInput::layout_type("grid", vec![AxisType::Cartesian]).is_ok());
    }

    #[test]
    fn plain_rejects_labels_with_extra_fields() {
        assert!(EntryKind::plain(OntologyEntryLabel::Scale).is_err());
        assert_eq!(
            EntryKind::plain(OntologyEntryLabel::Design).map(|kind| kind.label()),
            Ok(OntologyEntryLabel::Design)
        );
    }

    #[test]
    fn serialized_entries_carry_their_label() -> Result<(), Box<dyn std::error::Error>> {
        let entry = OntologyEntryInput::scale("Score", ScaleType::Ordinal)?.into_stored(EntryId(4));
        let value = serde_json::to_value(&entry)?;
        assert_eq!(value["label"], "SCALE");
        assert_eq!(value["scale_type"], "ORDINAL");
        assert_eq!(value["id"], 4);
        let back: OntologyEntry = serde_json::from_value(value)?;
        assert_eq!(back, entry);
        Ok(())
    }

    #[test]
    fn labels_parse_case_insensitively() {
        assert_eq!(
            OntologyEntryLabel::parse("observation_method"),
            Some(OntologyEntryLabel::ObservationMethod)
        );
        assert_eq!(OntologyEntryLabel::ALL.len(), 18);
        assert_eq!(ScaleType::parse("NOMINAL"), Some(ScaleType::Nominal));
    }

    #[test]
    fn stored_entries_need_positive_ids() {
        let result = OntologyEntry::load(EntryId(-2), EntryKind::Term, EntryFields::named("t"));
        assert!(result.is_err());
    }
}
