//! Market classification and score-based selection settlement.
//!
//! Textual market descriptions ("Asian Handicap", "Over/Under 2.5", ...) are
//! classified once, at placement, into a closed [`Selection`].  The classified
//! value is persisted as JSON and settled directly against the final score
//! without re-parsing any text.
//!
//! Handicap and total lines are held in quarter-goal units so quarter lines
//! (x.25 / x.75) split cleanly into their two neighbouring half lines.

use serde::{Deserialize, Serialize};

use crate::db::models::WagerStatus;

/// A handicap or totals line in quarter-goal units (`2.25` → `9`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Line(i32);

impl Line {
    pub fn from_f64(v: f64) -> Option<Line> {
        if !v.is_finite() {
            return None;
        }
        let q = v * 4.0;
        if (q - q.round()).abs() > 1e-9 {
            return None;
        }
        Some(Line(q.round() as i32))
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 4.0
    }

    fn is_quarter(self) -> bool {
        self.0 % 2 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketKind {
    /// 1X2 on the full-time score
    MatchResult,
    DoubleChance,
    /// Stake returned on a draw
    DrawNoBet,
    TotalGoals { line: Line },
    /// Line is the handicap applied to the picked side
    AsianHandicap { line: Line },
    BothTeamsToScore,
    CorrectScore,
    OddEven,
}

impl MarketKind {
    pub fn label(&self) -> String {
        match self {
            MarketKind::MatchResult => "Match Result".to_string(),
            MarketKind::DoubleChance => "Double Chance".to_string(),
            MarketKind::DrawNoBet => "Draw No Bet".to_string(),
            MarketKind::TotalGoals { line } => format!("Total Goals {}", line.as_f64()),
            MarketKind::AsianHandicap { line } => format!("Asian Handicap {:+}", line.as_f64()),
            MarketKind::BothTeamsToScore => "Both Teams To Score".to_string(),
            MarketKind::CorrectScore => "Correct Score".to_string(),
            MarketKind::OddEven => "Odd/Even".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "pick", rename_all = "snake_case")]
pub enum Pick {
    Home,
    Draw,
    Away,
    HomeOrDraw,
    HomeOrAway,
    DrawOrAway,
    Over,
    Under,
    Yes,
    No,
    Score { home: i32, away: i32 },
    Odd,
    Even,
}

/// A classified market + pick, ready to settle against a final score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub market: MarketKind,
    pub pick: Pick,
}

impl Selection {
    /// Classify a textual market/selection pair.
    ///
    /// `home_team` / `away_team` let selections that name a team ("Arsenal",
    /// "Chelsea +0.5") resolve to the right side.
    pub fn classify(
        market_name: &str,
        selection_name: &str,
        home_team: &str,
        away_team: &str,
    ) -> Result<Selection, String> {
        let market = normalize(market_name);
        let sel = normalize(selection_name);
        if sel.is_empty() {
            return Err("selection name is empty".to_string());
        }

        if let Some(scope) = unsettleable_scope(&market) {
            return Err(format!(
                "market '{}' settles on {}, not the full-time goal score",
                market_name, scope
            ));
        }

        let selection = match market_family(&market) {
            Some(Family::MatchResult) => {
                let pick = side_or_draw(&sel, home_team, away_team)
                    .ok_or_else(|| format!("unknown match-result selection '{}'", selection_name))?;
                Selection { market: MarketKind::MatchResult, pick }
            }
            Some(Family::DoubleChance) => {
                let pick = match sel.as_str() {
                    "1x" | "home or draw" | "home draw" => Pick::HomeOrDraw,
                    "12" | "home or away" | "home away" => Pick::HomeOrAway,
                    "x2" | "draw or away" | "draw away" => Pick::DrawOrAway,
                    _ => {
                        return Err(format!(
                            "unknown double-chance selection '{}'",
                            selection_name
                        ))
                    }
                };
                Selection { market: MarketKind::DoubleChance, pick }
            }
            Some(Family::DrawNoBet) => {
                let pick = match side_or_draw(&sel, home_team, away_team) {
                    Some(p @ (Pick::Home | Pick::Away)) => p,
                    _ => {
                        return Err(format!(
                            "unknown draw-no-bet selection '{}'",
                            selection_name
                        ))
                    }
                };
                Selection { market: MarketKind::DrawNoBet, pick }
            }
            Some(Family::Totals) => {
                let pick = if sel.starts_with("over") {
                    Pick::Over
                } else if sel.starts_with("under") {
                    Pick::Under
                } else {
                    return Err(format!("unknown totals selection '{}'", selection_name));
                };
                let line = parse_line(&sel)
                    .or_else(|| parse_line(&market))
                    .and_then(Line::from_f64)
                    .filter(|l| l.0 >= 0)
                    .ok_or_else(|| format!("totals line missing in '{}'", selection_name))?;
                Selection { market: MarketKind::TotalGoals { line }, pick }
            }
            Some(Family::Handicap) => {
                let side_text = strip_line(&sel);
                let pick = match side_or_draw(&side_text, home_team, away_team) {
                    Some(p @ (Pick::Home | Pick::Away)) => p,
                    _ => {
                        return Err(format!(
                            "unknown handicap selection '{}'",
                            selection_name
                        ))
                    }
                };
                let line = parse_line(&sel)
                    .or_else(|| parse_line(&market))
                    .and_then(Line::from_f64)
                    .ok_or_else(|| format!("handicap line missing in '{}'", selection_name))?;
                Selection { market: MarketKind::AsianHandicap { line }, pick }
            }
            Some(Family::BothTeamsToScore) => {
                let pick = match sel.as_str() {
                    "yes" | "y" => Pick::Yes,
                    "no" | "n" => Pick::No,
                    _ => return Err(format!("unknown btts selection '{}'", selection_name)),
                };
                Selection { market: MarketKind::BothTeamsToScore, pick }
            }
            Some(Family::CorrectScore) => {
                let (home, away) = parse_score(&sel)
                    .ok_or_else(|| format!("unparseable correct score '{}'", selection_name))?;
                Selection {
                    market: MarketKind::CorrectScore,
                    pick: Pick::Score { home, away },
                }
            }
            Some(Family::OddEven) => {
                let pick = match sel.as_str() {
                    "odd" => Pick::Odd,
                    "even" => Pick::Even,
                    _ => return Err(format!("unknown odd/even selection '{}'", selection_name)),
                };
                Selection { market: MarketKind::OddEven, pick }
            }
            None => return Err(format!("unsupported market '{}'", market_name)),
        };
        Ok(selection)
    }

    /// Settle the selection against a full-time score.
    ///
    /// Returns `None` for a market/pick pairing `classify` never produces.
    pub fn settle(&self, home: i32, away: i32) -> Option<WagerStatus> {
        use Pick::*;
        let status = match (self.market, self.pick) {
            (MarketKind::MatchResult, Home) => won_if(home > away),
            (MarketKind::MatchResult, Draw) => won_if(home == away),
            (MarketKind::MatchResult, Away) => won_if(away > home),
            (MarketKind::DoubleChance, HomeOrDraw) => won_if(home >= away),
            (MarketKind::DoubleChance, HomeOrAway) => won_if(home != away),
            (MarketKind::DoubleChance, DrawOrAway) => won_if(away >= home),
            (MarketKind::DrawNoBet, _) if home == away => WagerStatus::Void,
            (MarketKind::DrawNoBet, Home) => won_if(home > away),
            (MarketKind::DrawNoBet, Away) => won_if(away > home),
            (MarketKind::TotalGoals { line }, Over) => line_outcome((home + away) * 4 - line.0, line),
            (MarketKind::TotalGoals { line }, Under) => line_outcome(line.0 - (home + away) * 4, line),
            (MarketKind::AsianHandicap { line }, Home) => line_outcome((home - away) * 4 + line.0, line),
            (MarketKind::AsianHandicap { line }, Away) => line_outcome((away - home) * 4 + line.0, line),
            (MarketKind::BothTeamsToScore, Yes) => won_if(home > 0 && away > 0),
            (MarketKind::BothTeamsToScore, No) => won_if(home == 0 || away == 0),
            (MarketKind::CorrectScore, Score { home: h, away: a }) => won_if(home == h && away == a),
            (MarketKind::OddEven, Odd) => won_if((home + away) % 2 == 1),
            (MarketKind::OddEven, Even) => won_if((home + away) % 2 == 0),
            _ => return None,
        };
        Some(status)
    }
}

/// Decimal odds must be a finite multiplier above 1.0.
pub fn validate_odds(odds: f64) -> bool {
    odds.is_finite() && odds > 1.0
}

fn won_if(cond: bool) -> WagerStatus {
    if cond {
        WagerStatus::Won
    } else {
        WagerStatus::Lost
    }
}

/// Outcome at a whole or half line, given the margin (quarter units) by which
/// the pick beats the line.
fn half_line_outcome(margin_q: i32) -> WagerStatus {
    match margin_q.signum() {
        1 => WagerStatus::Won,
        -1 => WagerStatus::Lost,
        _ => WagerStatus::Void,
    }
}

fn line_outcome(margin_q: i32, line: Line) -> WagerStatus {
    if !line.is_quarter() {
        return half_line_outcome(margin_q);
    }
    // A quarter line is half the stake on each neighbouring half line.
    let lower = half_line_outcome(margin_q - 1);
    let upper = half_line_outcome(margin_q + 1);
    match (lower, upper) {
        (a, b) if a == b => a,
        (WagerStatus::Void, WagerStatus::Won) | (WagerStatus::Won, WagerStatus::Void) => {
            WagerStatus::HalfWon
        }
        (WagerStatus::Void, WagerStatus::Lost) | (WagerStatus::Lost, WagerStatus::Void) => {
            WagerStatus::HalfLost
        }
        _ => WagerStatus::Void,
    }
}

enum Family {
    MatchResult,
    DoubleChance,
    DrawNoBet,
    Totals,
    Handicap,
    BothTeamsToScore,
    CorrectScore,
    OddEven,
}

/// Statistics other than goals; the feed only carries the final score.
const OTHER_STATISTICS: &[(&str, &str)] = &[
    ("corner", "corners"),
    ("corners", "corners"),
    ("card", "cards"),
    ("cards", "cards"),
    ("booking", "bookings"),
    ("bookings", "bookings"),
    ("shot", "shots"),
    ("shots", "shots"),
    ("foul", "fouls"),
    ("fouls", "fouls"),
    ("offside", "offsides"),
    ("offsides", "offsides"),
    ("points", "points"),
    ("player", "a player statistic"),
];

/// Part-of-match markets.
const PERIODS: &[&str] = &[
    "half", "halftime", "ht", "1h", "2h", "1st", "2nd", "3rd", "4th", "first", "second",
    "quarter", "quarters", "period", "periods", "set", "sets", "inning", "innings",
];

/// Why a market cannot be settled from a full-time score, if it cannot.
fn unsettleable_scope(market: &str) -> Option<&'static str> {
    let tokens: Vec<&str> = market
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|t| !t.is_empty())
        .collect();
    if let Some((_, stat)) = OTHER_STATISTICS
        .iter()
        .find(|(word, _)| tokens.contains(word))
    {
        return Some(*stat);
    }
    if tokens.iter().any(|t| PERIODS.contains(t)) {
        return Some("part of the match");
    }
    // "Home Team Total", "Arsenal Total Goals": one side's goals, not the sum
    if tokens.windows(2).any(|w| w == ["team", "total"]) {
        return Some("one team's goals");
    }
    None
}

fn market_family(market: &str) -> Option<Family> {
    // Order matters: "total goals odd/even" is odd/even, not totals.
    if market.contains("odd") && market.contains("even") {
        return Some(Family::OddEven);
    }
    if market.contains("double chance") {
        return Some(Family::DoubleChance);
    }
    if market.contains("draw no bet") || market == "dnb" {
        return Some(Family::DrawNoBet);
    }
    if market.contains("both teams") || market == "btts" {
        return Some(Family::BothTeamsToScore);
    }
    if market.contains("correct score") || market.contains("exact score") {
        return Some(Family::CorrectScore);
    }
    if market.contains("handicap") || market.contains("spread") {
        return Some(Family::Handicap);
    }
    if market.contains("over") || market.contains("under") || market.contains("total") {
        return Some(Family::Totals);
    }
    match market {
        "1x2" | "match result" | "full time result" | "match winner" | "winner"
        | "moneyline" | "match odds" | "3way result" => Some(Family::MatchResult),
        _ => None,
    }
}

fn side_or_draw(sel: &str, home_team: &str, away_team: &str) -> Option<Pick> {
    match sel {
        "1" | "home" => return Some(Pick::Home),
        "x" | "draw" | "tie" => return Some(Pick::Draw),
        "2" | "away" => return Some(Pick::Away),
        _ => {}
    }
    let home = normalize(home_team);
    let away = normalize(away_team);
    if !home.is_empty() && sel == home {
        Some(Pick::Home)
    } else if !away.is_empty() && sel == away {
        Some(Pick::Away)
    } else {
        None
    }
}

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '+' | '-' | ',' | ':') {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_number(token: &str) -> Option<f64> {
    let t = token.trim_start_matches('+');
    // Split-line notation "0,-0.5" means the quarter line between them.
    if let Some((a, b)) = t.split_once(',') {
        let a: f64 = a.trim_start_matches('+').parse().ok()?;
        let b: f64 = b.trim_start_matches('+').parse().ok()?;
        return Some((a + b) / 2.0);
    }
    t.parse().ok()
}

/// The last numeric token in the text, if any.
fn parse_line(text: &str) -> Option<f64> {
    text.split_whitespace().rev().find_map(parse_number)
}

/// Drop the trailing line token: "arsenal -0.75" → "arsenal", "1 -0.5" → "1".
fn strip_line(text: &str) -> String {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() > 1 && tokens.last().is_some_and(|t| parse_number(t).is_some()) {
        tokens.pop();
    }
    tokens.join(" ")
}

fn parse_score(text: &str) -> Option<(i32, i32)> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let (h, a) = compact.split_once(['-', ':'])?;
    Some((h.parse().ok()?, a.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(market: &str, sel: &str) -> Selection {
        Selection::classify(market, sel, "Arsenal", "Chelsea").expect("classifiable")
    }

    #[test]
    fn test_classify_match_result_by_code_and_team_name() {
        assert_eq!(classify("1X2", "1").pick, Pick::Home);
        assert_eq!(classify("Match Result", "Draw").pick, Pick::Draw);
        assert_eq!(classify("Match Winner", "Chelsea").pick, Pick::Away);
    }

    #[test]
    fn test_classify_totals_line_from_selection_or_market() {
        let s = classify("Total Goals", "Over 2.5");
        assert_eq!(s.market, MarketKind::TotalGoals { line: Line(10) });
        assert_eq!(s.pick, Pick::Over);

        let s = classify("Over/Under 2.25", "Under");
        assert_eq!(s.market, MarketKind::TotalGoals { line: Line(9) });
        assert_eq!(s.pick, Pick::Under);
    }

    #[test]
    fn test_classify_handicap_with_team_name_and_split_notation() {
        let s = classify("Asian Handicap", "Arsenal -0.75");
        assert_eq!(s.market, MarketKind::AsianHandicap { line: Line(-3) });
        assert_eq!(s.pick, Pick::Home);

        let s = classify("Asian Handicap", "Away 0,+0.5");
        assert_eq!(s.market, MarketKind::AsianHandicap { line: Line(1) });
        assert_eq!(s.pick, Pick::Away);
    }

    #[test]
    fn test_classify_rejects_unknown_market() {
        assert!(Selection::classify("First Goalscorer", "Saka", "Arsenal", "Chelsea").is_err());
        assert!(Selection::classify("Total Goals", "Over", "Arsenal", "Chelsea").is_err());
        assert!(Selection::classify("Draw No Bet", "Draw", "Arsenal", "Chelsea").is_err());
    }

    #[test]
    fn test_classify_rejects_non_goal_statistics() {
        for (market, sel) in [
            ("Total Corners", "Over 9.5"),
            ("Cards Over/Under", "Under 4.5"),
            ("Total Bookings", "Over 3.5"),
            ("Shots On Target Over/Under", "Over 8.5"),
            ("Total Fouls", "Under 22.5"),
            ("Offsides Over/Under", "Over 3.5"),
            ("Total Points", "Over 210.5"),
            ("Player Total Shots", "Over 1.5"),
            ("Corners Handicap", "Home -1.5"),
        ] {
            let err = Selection::classify(market, sel, "Arsenal", "Chelsea").unwrap_err();
            assert!(err.contains("settles on"), "{}: {}", market, err);
        }
    }

    #[test]
    fn test_classify_rejects_part_of_match_markets() {
        for (market, sel) in [
            ("1st Half Total Goals", "Over 0.5"),
            ("2nd Half Asian Handicap", "Home -0.5"),
            ("Half Time Result", "1"),
            ("First-Half Over/Under", "Under 1.5"),
            ("HT Double Chance", "1X"),
            ("1st Quarter Spread", "Home +2.5"),
            ("Period 1 Total", "Over 1.5"),
            ("Set 1 Winner", "Home"),
            ("First 5 Innings Total", "Over 4.5"),
        ] {
            let err = Selection::classify(market, sel, "Arsenal", "Chelsea").unwrap_err();
            assert!(err.contains("part of the match"), "{}: {}", market, err);
        }
    }

    #[test]
    fn test_classify_rejects_single_team_totals() {
        let err = Selection::classify("Home Team Total Goals", "Over 1.5", "Arsenal", "Chelsea")
            .unwrap_err();
        assert!(err.contains("one team's goals"));
        // Both-teams markets are still fine
        assert_eq!(classify("Both Teams To Score", "Yes").market, MarketKind::BothTeamsToScore);
    }

    #[test]
    fn test_classify_odd_even_takes_precedence_over_totals() {
        let s = classify("Total Goals Odd/Even", "Odd");
        assert_eq!(s.market, MarketKind::OddEven);
    }

    #[test]
    fn test_settle_match_result_and_double_chance() {
        assert_eq!(classify("1X2", "1").settle(2, 1), Some(WagerStatus::Won));
        assert_eq!(classify("1X2", "X").settle(2, 1), Some(WagerStatus::Lost));
        assert_eq!(classify("Double Chance", "X2").settle(1, 1), Some(WagerStatus::Won));
    }

    #[test]
    fn test_settle_draw_no_bet_voids_on_draw() {
        assert_eq!(classify("Draw No Bet", "Home").settle(0, 0), Some(WagerStatus::Void));
        assert_eq!(classify("Draw No Bet", "Home").settle(0, 1), Some(WagerStatus::Lost));
    }

    #[test]
    fn test_settle_whole_line_pushes() {
        assert_eq!(classify("Total Goals", "Over 2").settle(1, 1), Some(WagerStatus::Void));
        assert_eq!(classify("Asian Handicap", "Home -1").settle(2, 1), Some(WagerStatus::Void));
    }

    #[test]
    fn test_settle_quarter_lines_split() {
        // -0.25 on a draw: half pushes at 0, half loses at -0.5
        assert_eq!(classify("Asian Handicap", "Home -0.25").settle(1, 1), Some(WagerStatus::HalfLost));
        // -0.75 winning by one: half wins at -0.5, half pushes at -1
        assert_eq!(classify("Asian Handicap", "Home -0.75").settle(1, 0), Some(WagerStatus::HalfWon));
        // Over 2.25 with two goals: half pushes at 2, half loses at 2.5
        assert_eq!(classify("Total Goals", "Over 2.25").settle(1, 1), Some(WagerStatus::HalfLost));
        // Under 2.75 with three goals: half pushes at 3, half loses at 2.5
        assert_eq!(classify("Total Goals", "Under 2.75").settle(2, 1), Some(WagerStatus::HalfLost));
        // Over 2.75 with three goals
        assert_eq!(classify("Total Goals", "Over 2.75").settle(2, 1), Some(WagerStatus::HalfWon));
    }

    #[test]
    fn test_settle_btts_correct_score_odd_even() {
        assert_eq!(classify("BTTS", "Yes").settle(1, 0), Some(WagerStatus::Lost));
        assert_eq!(classify("Correct Score", "2-1").settle(2, 1), Some(WagerStatus::Won));
        assert_eq!(classify("Odd/Even", "Even").settle(2, 2), Some(WagerStatus::Won));
    }

    #[test]
    fn test_settle_rejects_impossible_pairing() {
        let s = Selection {
            market: MarketKind::BothTeamsToScore,
            pick: Pick::Over,
        };
        assert_eq!(s.settle(1, 1), None);
    }

    #[test]
    fn test_validate_odds() {
        assert!(validate_odds(1.01));
        assert!(!validate_odds(1.0));
        assert!(!validate_odds(f64::NAN));
    }
}
