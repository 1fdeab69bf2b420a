pub mod icons;
pub mod output;
pub mod progress;
pub mod progress_message;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{error, header, info, layer, section, status, success, summary_row, warn};
pub use progress::{ProgressManager, Spinner};
pub use progress_message::{ProgressMessage, ProgressPhase};
pub use table::{stats_table, CollectionTable, TableBuilder};
pub use theme::{output_mode, palette, OutputMode, Palette};
