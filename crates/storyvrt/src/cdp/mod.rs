pub mod chrome;
pub mod connection;

pub use self::chrome::Chrome;
pub use self::connection::{CdpConnection, ConsoleMessage};
