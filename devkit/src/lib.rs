/*!
# Smokewatch DevKit - Stubs et utilitaires de test

Bibliothèque de test du noyau d'ingestion :
- StubBroker : broker MQTT en mémoire (publication, coupure, refus de connexion)
- RecordingTransport : transport d'alerte qui enregistre les envois
- FlakyStore : store dont les insert échouent ou ralentissent sur commande
- TestHarness : pipeline complet câblé sur ces stubs
*/

pub mod mqtt_stub;
pub mod notify_stub;
pub mod store_stub;
pub mod test_utils;

pub use mqtt_stub::{PayloadBuilder, StubBroker};
pub use notify_stub::{Delivery, RecordingTransport};
pub use store_stub::FlakyStore;
pub use test_utils::{manager_with_handler, wait_for_state, wait_until, HarnessBuilder, TestHarness};
