mod painter;
mod preview_view;
mod receipt_view;
mod scan_view;
mod spinner;
mod table;

pub(crate) use self::painter::Painter;
pub(crate) use self::preview_view::PreviewView;
pub(crate) use self::receipt_view::ReceiptView;
pub(crate) use self::scan_view::ScanView;
pub(crate) use self::spinner::Spinner;
