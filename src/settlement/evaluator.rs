//! Pure outcome evaluation: leg status from a final result, wager status and
//! payout from leg statuses.  No I/O.

use serde::Serialize;
use tracing::warn;

use crate::db::models::{Leg, Wager, WagerKind, WagerStatus};
use crate::db::round_cents;
use crate::resolver::FinalResult;

/// Status and payout computed for a wager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    pub status: WagerStatus,
    /// Rounded to cents; 0 for anything not terminal
    pub payout: f64,
}

impl Decision {
    pub fn profit(&self, stake: f64) -> f64 {
        round_cents(self.payout - stake)
    }
}

/// Settle one leg against a final result.
///
/// An explicit per-selection flag from the feed wins over score-based
/// evaluation; a withdrawn market voids the leg.
pub fn evaluate_leg(leg: &Leg, result: &FinalResult) -> WagerStatus {
    if let Some(flag) = result
        .selection_results
        .iter()
        .find(|s| s.selection_id == leg.selection_id)
    {
        return if flag.void {
            WagerStatus::Void
        } else if flag.won {
            WagerStatus::Won
        } else {
            WagerStatus::Lost
        };
    }

    match leg.selection.settle(result.home_score, result.away_score) {
        Some(status) => status,
        None => {
            warn!(
                "Leg {} of event {} has an unsettleable selection {:?}, voiding",
                leg.leg_index, leg.event_id, leg.selection
            );
            WagerStatus::Void
        }
    }
}

/// Payout of a single selection at `odds` for the given status.
pub fn settle_single(stake: f64, odds: f64, status: WagerStatus) -> Decision {
    let payout = match status {
        WagerStatus::Won => stake * odds,
        WagerStatus::Lost => 0.0,
        WagerStatus::Void => stake,
        // Half the stake wins at odds, the other half is returned
        WagerStatus::HalfWon => stake + (stake / 2.0) * (odds - 1.0),
        // Half the stake is lost, the other half is returned
        WagerStatus::HalfLost => stake / 2.0,
        WagerStatus::Pending | WagerStatus::Cancelled => 0.0,
    };
    Decision {
        status,
        payout: round_cents(payout),
    }
}

/// Combine leg outcomes of a combination wager.
///
/// `legs` pairs each leg's status with its odds at placement.
pub fn aggregate(stake: f64, legs: &[(WagerStatus, f64)]) -> Decision {
    let any = |s: WagerStatus| legs.iter().any(|(st, _)| *st == s);

    if legs.is_empty() || any(WagerStatus::Pending) && !any(WagerStatus::Lost) {
        return Decision {
            status: WagerStatus::Pending,
            payout: 0.0,
        };
    }
    if any(WagerStatus::Lost) {
        return Decision {
            status: WagerStatus::Lost,
            payout: 0.0,
        };
    }
    if any(WagerStatus::Cancelled) {
        return Decision {
            status: WagerStatus::Cancelled,
            payout: 0.0,
        };
    }
    if legs.iter().all(|(s, _)| *s == WagerStatus::Void) {
        return Decision {
            status: WagerStatus::Void,
            payout: round_cents(stake),
        };
    }

    let multiplier: f64 = legs.iter().map(|(s, odds)| leg_multiplier(*s, *odds)).product();
    let status = if any(WagerStatus::HalfLost) {
        WagerStatus::HalfLost
    } else if any(WagerStatus::HalfWon) {
        WagerStatus::HalfWon
    } else {
        WagerStatus::Won
    };
    Decision {
        status,
        payout: round_cents(stake * multiplier),
    }
}

fn leg_multiplier(status: WagerStatus, odds: f64) -> f64 {
    match status {
        WagerStatus::Won => odds,
        WagerStatus::HalfWon => (1.0 + odds) / 2.0,
        WagerStatus::HalfLost => 0.5,
        // Void legs drop out of the product
        _ => 1.0,
    }
}

/// Decision for a whole wager given the current status of each leg, in leg order.
pub fn evaluate_wager(wager: &Wager, leg_statuses: &[WagerStatus]) -> Decision {
    match wager.kind {
        WagerKind::Single => {
            let status = leg_statuses.first().copied().unwrap_or(WagerStatus::Pending);
            let odds = wager
                .legs
                .first()
                .map_or(wager.total_odds, |leg| leg.odds_at_placement);
            settle_single(wager.stake, odds, status)
        }
        WagerKind::Combination => {
            let legs: Vec<(WagerStatus, f64)> = wager
                .legs
                .iter()
                .zip(leg_statuses)
                .map(|(leg, status)| (*status, leg.odds_at_placement))
                .collect();
            aggregate(wager.stake, &legs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markets::Selection;
    use crate::resolver::{MatchSource, SelectionResult};
    use approx::assert_relative_eq;
    use chrono::Utc;
    use WagerStatus::*;

    fn leg(market: &str, selection: &str) -> Leg {
        Leg {
            leg_index: 0,
            event_id: "e1".into(),
            sport: "soccer".into(),
            league: None,
            home_team: "Arsenal".into(),
            away_team: "Chelsea".into(),
            market_id: "m1".into(),
            selection_id: "s1".into(),
            market_name: market.into(),
            selection_name: selection.into(),
            selection: Selection::classify(market, selection, "Arsenal", "Chelsea").unwrap(),
            odds_at_placement: 2.0,
            event_start_time: Utc::now(),
            estimated_settlement_time: Utc::now(),
            status: Pending,
        }
    }

    fn result(home: i32, away: i32, flags: Vec<SelectionResult>) -> FinalResult {
        FinalResult {
            event_id: "e1".into(),
            home_score: home,
            away_score: away,
            selection_results: flags,
            matched_by: MatchSource::Provider,
        }
    }

    #[test]
    fn test_combination_any_lost_pays_nothing() {
        let d = aggregate(100.0, &[(Won, 5.0), (Won, 3.0), (Lost, 1.5)]);
        assert_eq!(d.status, Lost);
        assert_eq!(d.payout, 0.0);
    }

    #[test]
    fn test_combination_void_leg_is_multiplier_one() {
        let d = aggregate(100.0, &[(Won, 2.0), (Void, 3.0)]);
        assert_eq!(d.status, Won);
        assert_relative_eq!(d.payout, 200.0);
    }

    #[test]
    fn test_combination_pending_leg_keeps_wager_pending() {
        let d = aggregate(100.0, &[(Won, 2.0), (Pending, 3.0)]);
        assert_eq!(d.status, Pending);
        // A lost leg settles the wager even with another leg unresolved
        assert_eq!(aggregate(100.0, &[(Lost, 2.0), (Pending, 3.0)]).status, Lost);
    }

    #[test]
    fn test_combination_half_outcomes_multiply() {
        let d = aggregate(100.0, &[(Won, 2.0), (HalfWon, 1.9)]);
        assert_eq!(d.status, HalfWon);
        assert_relative_eq!(d.payout, 290.0);

        let d = aggregate(100.0, &[(Won, 2.0), (HalfLost, 1.9)]);
        assert_eq!(d.status, HalfLost);
        assert_relative_eq!(d.payout, 100.0);
    }

    #[test]
    fn test_combination_all_void_refunds() {
        let d = aggregate(40.0, &[(Void, 2.0), (Void, 3.0)]);
        assert_eq!(d.status, Void);
        assert_relative_eq!(d.payout, 40.0);
    }

    #[test]
    fn test_combination_cancelled_leg() {
        let d = aggregate(40.0, &[(Won, 2.0), (Cancelled, 3.0)]);
        assert_eq!(d.status, Cancelled);
        assert_eq!(d.payout, 0.0);
    }

    #[test]
    fn test_half_win_and_half_loss_arithmetic() {
        let hw = settle_single(100.0, 2.0, HalfWon);
        assert_relative_eq!(hw.profit(100.0), 50.0);
        let hl = settle_single(100.0, 2.0, HalfLost);
        assert_relative_eq!(hl.profit(100.0), -50.0);
    }

    #[test]
    fn test_single_payouts() {
        assert_relative_eq!(settle_single(10.0, 2.35, Won).payout, 23.5);
        assert_eq!(settle_single(10.0, 2.35, Lost).payout, 0.0);
        assert_relative_eq!(settle_single(10.0, 2.35, Void).payout, 10.0);
        assert_eq!(settle_single(10.0, 2.35, Pending).payout, 0.0);
    }

    #[test]
    fn test_payout_rounds_to_cents() {
        assert_relative_eq!(settle_single(3.33, 1.777, Won).payout, 5.92);
    }

    #[test]
    fn test_evaluate_leg_uses_score() {
        let l = leg("1X2", "1");
        assert_eq!(evaluate_leg(&l, &result(2, 0, vec![])), Won);
        assert_eq!(evaluate_leg(&l, &result(1, 1, vec![])), Lost);
    }

    #[test]
    fn test_evaluate_leg_explicit_flags_win() {
        let l = leg("1X2", "1");
        let won_flag = vec![SelectionResult {
            selection_id: "s1".into(),
            won: true,
            void: false,
        }];
        // Flag overrides a score that would lose
        assert_eq!(evaluate_leg(&l, &result(0, 3, won_flag)), Won);

        let withdrawn = vec![SelectionResult {
            selection_id: "s1".into(),
            won: false,
            void: true,
        }];
        assert_eq!(evaluate_leg(&l, &result(2, 0, withdrawn)), Void);
    }

    #[test]
    fn test_evaluate_leg_quarter_handicap() {
        let l = leg("Asian Handicap", "Arsenal -0.25");
        assert_eq!(evaluate_leg(&l, &result(1, 1, vec![])), HalfLost);
        assert_eq!(evaluate_leg(&l, &result(2, 1, vec![])), Won);
    }
}
