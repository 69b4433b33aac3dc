//! Raw ticker strings arrive from many UI surfaces: bare assets ("btc"),
//! venue-prefixed charting symbols ("BINANCE:ETHUSD"), legacy USD pairs, or
//! already-canonical exchange pairs. Everything funnels through
//! [`normalize_symbol`] before touching the registry or the stream.

/// Venue prefixes recognized in `VENUE:SYMBOL` inputs. Unknown prefixes are
/// left alone so genuinely invalid tickers degrade to an upstream
/// "symbol not found" instead of a normalizer failure.
const VENUE_PREFIXES: &[&str] = &["BINANCE", "COINBASE", "KRAKEN", "COINGECKO", "FX", "OANDA"];

/// The quote-asset suffix the upstream exchange streams are keyed by.
const CANONICAL_QUOTE: &str = "USDT";

/// Generic quote suffixes rewritten to the canonical one. Longer suffixes
/// listed first so `BUSD`/`USDC` are not mistaken for a trailing `USD`.
const LEGACY_QUOTES: &[&str] = &["BUSD", "USDC", "TUSD", "USD"];

/// Short tickers and legacy pairs with a fixed canonical form.
const KNOWN_TICKERS: &[(&str, &str)] = &[
    ("BTC", "BTCUSDT"),
    ("ETH", "ETHUSDT"),
    ("BNB", "BNBUSDT"),
    ("SOL", "SOLUSDT"),
    ("XRP", "XRPUSDT"),
    ("ADA", "ADAUSDT"),
    ("DOGE", "DOGEUSDT"),
    ("DOT", "DOTUSDT"),
    ("LTC", "LTCUSDT"),
    ("LINK", "LINKUSDT"),
    ("AVAX", "AVAXUSDT"),
    ("MATIC", "MATICUSDT"),
    ("BTCUSD", "BTCUSDT"),
    ("ETHUSD", "ETHUSDT"),
];

/// Map any accepted input symbol to its canonical exchange form.
///
/// Pure and total: no I/O, never fails, and idempotent —
/// `normalize_symbol(normalize_symbol(s)) == normalize_symbol(s)` for all `s`.
pub fn normalize_symbol(raw_symbol: &str) -> String {
    let trimmed = raw_symbol.trim().to_ascii_uppercase();

    let stripped = match trimmed.split_once(':') {
        Some((prefix, rest)) if VENUE_PREFIXES.contains(&prefix.trim()) => rest,
        _ => trimmed.as_str(),
    };

    let cleaned = stripped
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .collect::<String>();

    if cleaned.is_empty() {
        return cleaned;
    }

    if let Some((_, canonical)) = KNOWN_TICKERS.iter().find(|(ticker, _)| *ticker == cleaned) {
        return (*canonical).to_string();
    }

    if cleaned.len() > CANONICAL_QUOTE.len() && cleaned.ends_with(CANONICAL_QUOTE) {
        return cleaned;
    }

    for quote in LEGACY_QUOTES {
        if cleaned.len() > quote.len() && cleaned.ends_with(quote) {
            let base = &cleaned[..cleaned.len() - quote.len()];
            return format!("{base}{CANONICAL_QUOTE}");
        }
    }

    format!("{cleaned}{CANONICAL_QUOTE}")
}
